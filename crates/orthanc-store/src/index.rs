use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use orthanc_core::{
    ChangeKind, CompressionType, DicomTag, InternalId, MetadataKind, PublicId, ResourceLevel,
    TagValue,
};

use crate::db::{DbWrapper, NewAttachment, StoreStatus as DbStoreStatus};
use crate::error::StoreError;
use crate::storage::StorageArea;

/// The default poll period for the inactivity-timer thread that fires
/// `StableX` changes. Independent of the jobs engine's wakeup interval —
/// splitting the two loses nothing (spec.md §9 "Open questions").
const STABILITY_POLL: Duration = Duration::from_millis(500);

/// A single attachment handed to `store()`, already carrying whatever bytes
/// the caller wants persisted verbatim (compression, if any, already applied
/// by the caller).
pub struct IncomingAttachment {
    pub file_type: i64,
    pub bytes: Vec<u8>,
    pub compression: CompressionType,
    pub uncompressed_size: u64,
}

/// Everything `store()` needs about one incoming instance. Built by the
/// DIMSE layer from a parsed dataset; this crate never parses DICOM bytes
/// itself (that stays in `orthanc-dimse`).
pub struct IncomingInstance<'a> {
    pub patient_id: &'a str,
    pub study_instance_uid: &'a str,
    pub series_instance_uid: &'a str,
    pub sop_instance_uid: &'a str,
    pub main_tags: Vec<(ResourceLevel, DicomTag, TagValue)>,
    pub identifier_tags: Vec<(ResourceLevel, DicomTag, String)>,
    pub attachments: Vec<IncomingAttachment>,
    pub remote_aet: &'a str,
    pub transfer_syntax: &'a str,
    pub sop_class_uid: &'a str,
    pub index_in_series: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Success,
    AlreadyStored,
    FilteredOut,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    pub instance_id: Option<InternalId>,
}

/// A high-level event the index broadcasts to its single listener, derived
/// from the database wrapper's raw signals (spec.md §4.E "Change broadcast").
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub level: ResourceLevel,
    pub public_id: PublicId,
}

struct TouchEntry {
    level: ResourceLevel,
    public_id: PublicId,
    touched_at: Instant,
    fired: bool,
}

type Listener = Box<dyn Fn(Change) + Send + Sync>;

struct Inner {
    db: Arc<DbWrapper>,
    storage: Arc<dyn StorageArea>,
    max_storage_size: u64,
    stable_age: Duration,
    listener: Mutex<Option<Listener>>,
    last_touch: Mutex<HashMap<InternalId, TouchEntry>>,
    shutdown: AtomicBool,
}

impl Inner {
    fn emit(&self, kind: ChangeKind, level: ResourceLevel, public_id: PublicId) {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(Change { kind, level, public_id });
        }
    }

    fn touch(&self, id: InternalId, level: ResourceLevel, public_id: PublicId) {
        if level == ResourceLevel::Instance {
            return;
        }
        let mut touch = self.last_touch.lock().unwrap();
        touch.insert(id, TouchEntry { level, public_id, touched_at: Instant::now(), fired: false });
    }

    fn forget(&self, id: InternalId) {
        self.last_touch.lock().unwrap().remove(&id);
    }

    fn stability_sweep(&self) {
        let mut touch = self.last_touch.lock().unwrap();
        let now = Instant::now();
        for entry in touch.values_mut() {
            if !entry.fired && now.duration_since(entry.touched_at) >= self.stable_age {
                entry.fired = true;
                let kind = match entry.level {
                    ResourceLevel::Patient => ChangeKind::StablePatient,
                    ResourceLevel::Study => ChangeKind::StableStudy,
                    ResourceLevel::Series => ChangeKind::StableSeries,
                    ResourceLevel::Instance => continue,
                };
                drop(touch);
                self.emit(kind, entry.level, entry.public_id.clone());
                touch = self.last_touch.lock().unwrap();
            }
        }
    }
}

/// Sits above the database wrapper to enforce storage quotas, cascade
/// storage-area side effects after a transaction commits, and broadcast
/// high-level changes to at most one listener (spec.md §4.E).
pub struct ResourceIndex {
    inner: Arc<Inner>,
    stability_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ResourceIndex {
    pub fn new(
        db: Arc<DbWrapper>,
        storage: Arc<dyn StorageArea>,
        max_storage_size: u64,
        stable_age: Duration,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            db,
            storage,
            max_storage_size,
            stable_age,
            listener: Mutex::new(None),
            last_touch: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let sweeper = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || {
                while !inner.shutdown.load(Ordering::Relaxed) {
                    thread::sleep(STABILITY_POLL);
                    inner.stability_sweep();
                }
            })
        };

        Arc::new(ResourceIndex { inner, stability_thread: Mutex::new(Some(sweeper)) })
    }

    /// Register the single change listener. Replaces whatever was set before
    /// (spec.md §4.E "at most one listener per event class").
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(Change) + Send + Sync + 'static,
    {
        *self.inner.listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Stop the inactivity-timer thread and join it. Process-wide background
    /// threads must be joined on shutdown (spec.md §9).
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stability_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Create missing ancestors, the instance itself, its tags and
    /// attachments, all under one database transaction's worth of calls, then
    /// enforce the storage quota. Returns `AlreadyStored` without touching
    /// anything else if the instance's public id already exists (IV3).
    pub fn store(&self, instance: &IncomingInstance) -> Result<IngestOutcome, StoreError> {
        let db = &self.inner.db;

        let patient_pid = PublicId::compute(ResourceLevel::Patient, &[instance.patient_id]);
        let study_pid = PublicId::compute(
            ResourceLevel::Study,
            &[instance.patient_id, instance.study_instance_uid],
        );
        let series_pid = PublicId::compute(
            ResourceLevel::Series,
            &[instance.patient_id, instance.study_instance_uid, instance.series_instance_uid],
        );
        let instance_pid = PublicId::compute(
            ResourceLevel::Instance,
            &[
                instance.patient_id,
                instance.study_instance_uid,
                instance.series_instance_uid,
                instance.sop_instance_uid,
            ],
        );

        if let Some(existing) = db.lookup_resource(&instance_pid)? {
            return Ok(IngestOutcome { status: IngestStatus::AlreadyStored, instance_id: Some(existing) });
        }

        let (patient_id, patient_status) =
            db.create_resource_if_absent(ResourceLevel::Patient, &patient_pid, None)?;
        if patient_status == DbStoreStatus::Success {
            db.register_for_recycling(patient_id)?;
            self.inner.emit(ChangeKind::NewPatient, ResourceLevel::Patient, patient_pid.clone());
        }

        let (study_id, study_status) =
            db.create_resource_if_absent(ResourceLevel::Study, &study_pid, Some(patient_id))?;
        if study_status == DbStoreStatus::Success {
            self.inner.emit(ChangeKind::NewStudy, ResourceLevel::Study, study_pid.clone());
        }
        self.check_parent_consistency(study_id, patient_id, ResourceLevel::Study, &study_pid)?;

        let (series_id, series_status) =
            db.create_resource_if_absent(ResourceLevel::Series, &series_pid, Some(study_id))?;
        if series_status == DbStoreStatus::Success {
            self.inner.emit(ChangeKind::NewSeries, ResourceLevel::Series, series_pid.clone());
        }
        self.check_parent_consistency(series_id, study_id, ResourceLevel::Series, &series_pid)?;

        let (instance_id, instance_status) =
            db.create_resource_if_absent(ResourceLevel::Instance, &instance_pid, Some(series_id))?;
        if instance_status == DbStoreStatus::AlreadyStored {
            // Lost a race between the lookup above and the insert.
            return Ok(IngestOutcome { status: IngestStatus::AlreadyStored, instance_id: Some(instance_id) });
        }

        for (level, tag, value) in &instance.main_tags {
            let id = self.id_for_level(*level, patient_id, study_id, series_id, instance_id);
            db.set_main_dicom_tag(id, *tag, value)?;
        }
        for (level, tag, value) in &instance.identifier_tags {
            let id = self.id_for_level(*level, patient_id, study_id, series_id, instance_id);
            db.set_identifier_tag(id, *tag, value)?;
        }

        for attachment in &instance.attachments {
            let uuid = Uuid::new_v4().to_string();
            let digest = md5::compute(&attachment.bytes);
            let checksum = format!("{:x}", digest);
            self.inner
                .storage
                .create(&uuid, &attachment.bytes, attachment.compression)?;
            db.add_attachment(
                instance_id,
                &NewAttachment {
                    file_type: attachment.file_type,
                    uuid,
                    compressed_size: attachment.bytes.len() as u64,
                    uncompressed_size: attachment.uncompressed_size,
                    compression: attachment.compression,
                    uncompressed_md5: checksum.clone(),
                    compressed_md5: checksum,
                },
            )?;
        }

        db.set_metadata(instance_id, MetadataKind::RemoteAet, instance.remote_aet)?;
        db.set_metadata(instance_id, MetadataKind::ReceptionDate, &chrono::Utc::now().to_rfc3339())?;
        db.set_metadata(instance_id, MetadataKind::TransferSyntax, instance.transfer_syntax)?;
        db.set_metadata(instance_id, MetadataKind::SopClassUid, instance.sop_class_uid)?;
        if let Some(index) = instance.index_in_series {
            db.set_metadata(instance_id, MetadataKind::IndexInSeries, &index.to_string())?;
        }

        self.inner.emit(ChangeKind::NewInstance, ResourceLevel::Instance, instance_pid);
        self.inner.touch(series_id, ResourceLevel::Series, series_pid);
        self.inner.touch(study_id, ResourceLevel::Study, study_pid);
        self.inner.touch(patient_id, ResourceLevel::Patient, patient_pid);

        self.enforce_quota(patient_id)?;

        Ok(IngestOutcome { status: IngestStatus::Success, instance_id: Some(instance_id) })
    }

    fn id_for_level(
        &self,
        level: ResourceLevel,
        patient: InternalId,
        study: InternalId,
        series: InternalId,
        instance: InternalId,
    ) -> InternalId {
        match level {
            ResourceLevel::Patient => patient,
            ResourceLevel::Study => study,
            ResourceLevel::Series => series,
            ResourceLevel::Instance => instance,
        }
    }

    /// An instance's parent chain may span two files with the same
    /// study/series UIDs but different patient UIDs. The series/study keeps
    /// whichever parent was first associated with its public id; this just
    /// makes the conflict visible in the change log (spec.md §9 "Open
    /// questions", resolved first-seen-wins).
    fn check_parent_consistency(
        &self,
        child: InternalId,
        expected_parent: InternalId,
        level: ResourceLevel,
        public_id: &PublicId,
    ) -> Result<(), StoreError> {
        if let Some(actual_parent) = self.inner.db.parent_of(child)? {
            if actual_parent != expected_parent {
                self.inner.db.record_change(ChangeKind::InconsistentParent, child, level)?;
                self.inner.emit(ChangeKind::InconsistentParent, level, public_id.clone());
            }
        }
        Ok(())
    }

    /// If `max_storage_size` is set and the total compressed size exceeds it,
    /// repeatedly recycle the oldest unprotected patient (never the one
    /// currently being ingested) until back under quota or none remain.
    fn enforce_quota(&self, current_patient: InternalId) -> Result<(), StoreError> {
        if self.inner.max_storage_size == 0 {
            return Ok(());
        }
        loop {
            let stats = self.inner.db.get_statistics()?;
            if stats.total_compressed_size <= self.inner.max_storage_size {
                return Ok(());
            }
            let victim = self.inner.db.select_patient_to_recycle(Some(current_patient))?;
            match victim {
                Some(public_id) => {
                    self.delete_resource(&public_id)?;
                }
                None => return Err(StoreError::Core(orthanc_core::OrthancError::FullStorage)),
            }
        }
    }

    /// Resolve `public_id` to an internal id, cascade-delete via the database
    /// wrapper, then release every storage-area uuid the deletion freed —
    /// only after the owning transaction has returned (the deferred-signal
    /// design spec.md §9 calls for, so a rollback never leaks bytes).
    pub fn delete_resource(&self, public_id: &PublicId) -> Result<(), StoreError> {
        let Some(id) = self.inner.db.lookup_resource(public_id)? else {
            return Err(StoreError::Core(orthanc_core::OrthancError::UnknownResource(
                public_id.to_string(),
            )));
        };
        self.inner.forget(id);

        let outcome = self.inner.db.delete_resource(public_id)?;

        for deleted in &outcome.deleted_changes {
            self.inner.emit(ChangeKind::Deleted, ResourceLevel::Instance, deleted.clone());
        }
        for (uuid, _compression) in &outcome.file_deleted {
            self.inner.storage.remove(uuid)?;
        }
        if let Some((level, ancestor)) = outcome.remaining_ancestor {
            self.inner.emit(ChangeKind::UpdatedMetadata, level, ancestor);
        }
        Ok(())
    }

    pub fn lookup_identifier_exact(
        &self,
        level: ResourceLevel,
        tag: DicomTag,
        value: &str,
    ) -> Result<Vec<PublicId>, StoreError> {
        self.inner.db.lookup_identifier(
            level,
            tag,
            &orthanc_core::IdentifierConstraint::Equal(value.to_string()),
        )
    }

    pub fn get_statistics(&self) -> Result<crate::db::Statistics, StoreError> {
        self.inner.db.get_statistics()
    }

    /// Read an instance's stored bytes back out of the storage area, for the
    /// C-MOVE/C-GET retrieval path. `file_type` follows the same numbering
    /// `store()` uses when it calls `add_attachment`.
    pub fn read_attachment(&self, id: InternalId, file_type: i64) -> Result<Vec<u8>, StoreError> {
        let row = self
            .inner
            .db
            .lookup_attachment(id, file_type)?
            .ok_or_else(|| StoreError::Core(orthanc_core::OrthancError::InexistentFile(format!("{id}"))))?;
        self.inner.storage.read(&row.uuid, row.compression)
    }

    /// Direct access to the underlying database wrapper, for handler code
    /// (orthanc-dimse's `J` trait impls) that needs metadata/tag reads the
    /// index itself doesn't wrap (e.g. C-FIND answer assembly).
    pub fn db(&self) -> &Arc<DbWrapper> {
        &self.inner.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemStorageArea;
    use std::sync::atomic::AtomicUsize;

    fn index_with(max_storage_size: u64) -> (Arc<ResourceIndex>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(DbWrapper::open(":memory:").unwrap());
        let storage = Arc::new(FilesystemStorageArea::new(dir.path()));
        let index = ResourceIndex::new(db, storage, max_storage_size, Duration::from_secs(3600));
        (index, dir)
    }

    fn instance<'a>(patient: &'a str, study: &'a str, series: &'a str, sop: &'a str) -> IncomingInstance<'a> {
        IncomingInstance {
            patient_id: patient,
            study_instance_uid: study,
            series_instance_uid: series,
            sop_instance_uid: sop,
            main_tags: vec![],
            identifier_tags: vec![(ResourceLevel::Patient, DicomTag(0x0010, 0x0020), patient.to_string())],
            attachments: vec![IncomingAttachment {
                file_type: 1,
                bytes: vec![0u8; 1],
                compression: CompressionType::None,
                uncompressed_size: 1,
            }],
            remote_aet: "REMOTE",
            transfer_syntax: "1.2.840.10008.1.2.1",
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7",
            index_in_series: Some(1),
        }
    }

    #[test]
    fn storing_the_same_instance_twice_reports_already_stored() {
        let (index, _dir) = index_with(0);
        let inst = instance("P1", "S1", "SE1", "I1");
        let first = index.store(&inst).unwrap();
        assert_eq!(first.status, IngestStatus::Success);
        let second = index.store(&inst).unwrap();
        assert_eq!(second.status, IngestStatus::AlreadyStored);
        assert_eq!(first.instance_id, second.instance_id);
        index.shutdown();
    }

    #[test]
    fn quota_recycles_oldest_patient_first() {
        let (index, _dir) = index_with(3);
        for i in 0..4 {
            let patient = format!("P{i}");
            let inst = instance(&patient, "S", "SE", &format!("I{i}"));
            index.store(&inst).unwrap();
        }
        let stats = index.get_statistics().unwrap();
        assert!(stats.total_compressed_size <= 3);
        assert_eq!(stats.patients, 3);
        index.shutdown();
    }

    #[test]
    fn change_listener_observes_new_patient() {
        let (index, _dir) = index_with(0);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        index.set_listener(move |change| {
            if change.kind == ChangeKind::NewPatient {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        });
        index.store(&instance("P1", "S1", "SE1", "I1")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        index.shutdown();
    }
}
