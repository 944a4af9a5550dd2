use serde::{Deserialize, Serialize};

/// Raw YAML representation of the server's single configuration document.
/// Field names mirror spec.md §6's "Environment / configuration keys" list
/// verbatim, PascalCase, the way the original's JSON configuration does.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawConfig {
    #[serde(default = "default_storage_directory")]
    pub storage_directory: String,

    #[serde(default)]
    pub maximum_storage_size: u64,

    #[serde(default = "default_jobs_history_size")]
    pub jobs_history_size: usize,

    #[serde(default = "default_dicom_association_close_delay")]
    pub dicom_association_close_delay: u64,

    #[serde(default)]
    pub limit_find_results: usize,

    #[serde(default)]
    pub limit_find_instances: usize,

    #[serde(default)]
    pub workers: usize,

    #[serde(default, rename = "CaseSensitivePN")]
    pub case_sensitive_pn: bool,

    #[serde(default = "default_dicom_port")]
    pub dicom_port: u16,

    #[serde(default = "default_dicom_aet")]
    pub dicom_aet: String,

    #[serde(default = "default_sweep_interval_ms")]
    pub retry_sweep_interval_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub worker_wakeup_interval_ms: u64,

    #[serde(default = "default_stable_age_seconds")]
    pub stable_age_seconds: u64,

    #[serde(default)]
    pub known_modalities: Vec<RawModality>,
}

fn default_storage_directory() -> String {
    "OrthancStorage".to_string()
}

fn default_jobs_history_size() -> usize {
    10
}

fn default_dicom_association_close_delay() -> u64 {
    5
}

fn default_dicom_port() -> u16 {
    4242
}

fn default_dicom_aet() -> String {
    "ORTHANC".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    200
}

fn default_stable_age_seconds() -> u64 {
    60
}

/// One entry of the known-modalities table: a remote AE this server is
/// allowed to associate with as an SCU, or to accept associations from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawModality {
    pub aet: String,
    pub host: String,
    #[serde(default = "default_dicom_port")]
    pub port: u16,
}
