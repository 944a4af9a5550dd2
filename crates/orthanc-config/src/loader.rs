use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawConfig;

/// A remote AE this server may associate with, resolved from
/// `KnownModalities` and keyed by AET for the DIMSE layer's "remote AET is
/// known" check (spec.md §4.I C-FIND callback, first invocation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modality {
    pub aet: String,
    pub host: String,
    pub port: u16,
}

/// The converted, validated configuration this server runs with. Durations
/// are resolved from the raw millisecond/second fields so callers never
/// re-derive them.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_directory: String,
    pub maximum_storage_size: u64,
    pub jobs_history_size: usize,
    pub dicom_association_close_delay: Duration,
    pub limit_find_results: usize,
    pub limit_find_instances: usize,
    pub workers: usize,
    pub case_sensitive_pn: bool,
    pub dicom_port: u16,
    pub dicom_aet: String,
    pub retry_sweep_interval: Duration,
    pub worker_wakeup_interval: Duration,
    pub stable_age: Duration,
    pub known_modalities: HashMap<String, Modality>,
}

/// Load and validate the server's single YAML configuration document.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!(path = %path.display(), "loaded configuration");
    convert_config(raw, path)
}

fn convert_config(raw: RawConfig, path: &Path) -> Result<Config, ConfigError> {
    let workers = if raw.workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        raw.workers
    };

    let mut known_modalities = HashMap::new();
    for modality in raw.known_modalities {
        if modality.aet.is_empty() {
            return Err(ConfigError::Conversion {
                path: path.display().to_string(),
                message: "a known modality has an empty AET".to_string(),
            });
        }
        if known_modalities.insert(modality.aet.clone(), Modality {
            aet: modality.aet.clone(),
            host: modality.host,
            port: modality.port,
        }).is_some() {
            return Err(ConfigError::Conversion {
                path: path.display().to_string(),
                message: format!("duplicate modality AET '{}'", modality.aet),
            });
        }
    }

    Ok(Config {
        storage_directory: raw.storage_directory,
        maximum_storage_size: raw.maximum_storage_size,
        jobs_history_size: raw.jobs_history_size.max(1),
        dicom_association_close_delay: Duration::from_secs(raw.dicom_association_close_delay),
        limit_find_results: raw.limit_find_results,
        limit_find_instances: raw.limit_find_instances,
        workers: workers.max(1),
        case_sensitive_pn: raw.case_sensitive_pn,
        dicom_port: raw.dicom_port,
        dicom_aet: raw.dicom_aet,
        retry_sweep_interval: Duration::from_millis(raw.retry_sweep_interval_ms),
        worker_wakeup_interval: Duration::from_millis(raw.worker_wakeup_interval_ms),
        stable_age: Duration::from_secs(raw.stable_age_seconds),
        known_modalities,
    })
}
