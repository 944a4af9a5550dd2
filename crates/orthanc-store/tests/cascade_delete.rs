use std::sync::Arc;
use std::time::Duration;

use orthanc_core::{DicomTag, PublicId, ResourceLevel};
use orthanc_store::{DbWrapper, FilesystemStorageArea, IncomingAttachment, IncomingInstance, ResourceIndex};

fn instance<'a>(patient: &'a str, study: &'a str, series: &'a str, sop: &'a str, bytes: &'a [u8]) -> IncomingInstance<'a> {
    IncomingInstance {
        patient_id: patient,
        study_instance_uid: study,
        series_instance_uid: series,
        sop_instance_uid: sop,
        main_tags: vec![],
        identifier_tags: vec![(ResourceLevel::Patient, DicomTag(0x0010, 0x0020), patient.to_string())],
        attachments: vec![IncomingAttachment {
            file_type: 1,
            bytes: bytes.to_vec(),
            compression: orthanc_core::CompressionType::None,
            uncompressed_size: bytes.len() as u64,
        }],
        remote_aet: "TESTSCU",
        transfer_syntax: "1.2.840.10008.1.2.1",
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.7",
        index_in_series: None,
    }
}

/// Exercises P1/P2 end to end through `ResourceIndex`, not just the database
/// wrapper: deleting a patient must both drop every descendant row and erase
/// every attachment byte the patient's instances ever wrote to disk.
#[test]
fn deleting_a_patient_removes_every_descendant_and_every_attachment_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DbWrapper::open(":memory:").unwrap());
    let storage = Arc::new(FilesystemStorageArea::new(dir.path()));
    let index = ResourceIndex::new(db, storage, u64::MAX, Duration::from_secs(3600));

    let sop1 = "1.2.3.4.1";
    let sop2 = "1.2.3.4.2";
    index.store(&instance("P1", "S1", "SE1", sop1, b"one")).unwrap();
    index.store(&instance("P1", "S1", "SE1", sop2, b"two")).unwrap();

    let before = index.get_statistics().unwrap();
    assert_eq!(before.patients, 1);
    assert_eq!(before.instances, 2);

    let mut attachment_count = 0usize;
    for entry in walkdir(dir.path()) {
        attachment_count += 1;
        let _ = entry;
    }
    assert_eq!(attachment_count, 2);

    let patient_id = PublicId::compute(ResourceLevel::Patient, &["P1"]);
    index.delete_resource(&patient_id).unwrap();

    let after = index.get_statistics().unwrap();
    assert_eq!(after.patients, 0);
    assert_eq!(after.instances, 0);

    let remaining: usize = walkdir(dir.path()).count();
    assert_eq!(remaining, 0, "cascade delete must remove every attachment file, not just the database rows");
}

fn walkdir(root: &std::path::Path) -> impl Iterator<Item = std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.into_iter()
}
