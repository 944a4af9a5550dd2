use orthanc_config::load_config;
use std::path::Path;

#[test]
fn loads_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/orthanc.yml");
    let config = load_config(&path).expect("should load without error");

    assert_eq!(config.storage_directory, "/var/lib/orthanc/db");
    assert_eq!(config.maximum_storage_size, 1024);
    assert_eq!(config.jobs_history_size, 25);
    assert_eq!(config.dicom_association_close_delay.as_secs(), 10);
    assert_eq!(config.workers, 4);
    assert!(config.case_sensitive_pn);
    assert_eq!(config.dicom_aet, "TESTORTHANC");
    assert_eq!(config.known_modalities.len(), 2);
    assert!(config.known_modalities.contains_key("REMOTE1"));
}

#[test]
fn missing_keys_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minimal.yml");
    std::fs::write(&path, "StorageDirectory: /tmp/orthanc\n").unwrap();

    let config = load_config(&path).expect("defaults should fill in the rest");
    assert_eq!(config.storage_directory, "/tmp/orthanc");
    assert_eq!(config.dicom_port, 4242);
    assert_eq!(config.dicom_aet, "ORTHANC");
    assert!(config.workers >= 1);
    assert!(config.known_modalities.is_empty());
}

#[test]
fn duplicate_modality_aets_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.yml");
    std::fs::write(
        &path,
        "KnownModalities:\n  - Aet: SAME\n    Host: a\n  - Aet: SAME\n    Host: b\n",
    )
    .unwrap();

    assert!(load_config(&path).is_err());
}

#[test]
fn missing_file_returns_io_error() {
    let path = Path::new("/nonexistent/path/does/not/exist.yml");
    assert!(load_config(path).is_err());
}
