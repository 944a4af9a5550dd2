use std::collections::HashMap;
use std::sync::Arc;

use orthanc_core::{DicomTag, OrthancError, PublicId, ResourceLevel, TagValue};
use orthanc_store::{IncomingInstance, IngestStatus, ResourceIndex};

/// A flattened query: tag -> requested constraint value (possibly a
/// wildcard pattern, range endpoint, or exact string), matching the shape
/// a C-FIND/C-MOVE identifier dataset projects to.
pub type Identifier = HashMap<DicomTag, TagValue>;

/// Accumulates answers for a C-FIND/worklist request. The handler appends
/// in the order it wants them returned (spec.md §5 "responses emitted in
/// the order answers were appended").
#[derive(Debug, Default)]
pub struct AnswerSet {
    pub answers: Vec<Identifier>,
    /// Set by the handler when it stopped early (e.g. result limit hit),
    /// so the state machine emits Cancel instead of Success.
    pub incomplete: bool,
}

impl AnswerSet {
    pub fn push(&mut self, identifier: Identifier) {
        self.answers.push(identifier);
    }
}

/// Result of a single store request, handed back to the C-STORE state
/// machine so it can decide between Success and a warning status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    AlreadyStored,
}

pub trait StoreRequestHandler: Send + Sync {
    /// `bytes` is the serialized instance (Little Endian Explicit); `json`
    /// is the parsed-DICOM cache projection (spec.md §6).
    #[allow(clippy::too_many_arguments)]
    fn handle(
        &self,
        bytes: &[u8],
        summary: &Identifier,
        json: &serde_json::Value,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> Result<StoreStatus, OrthancError>;
}

pub trait FindRequestHandler: Send + Sync {
    fn handle(
        &self,
        answers: &mut AnswerSet,
        query: &Identifier,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> Result<(), OrthancError>;
}

pub trait WorklistRequestHandler: Send + Sync {
    fn handle(
        &self,
        answers: &mut AnswerSet,
        query_file: &Identifier,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> Result<(), OrthancError>;
}

/// Advanced once per sub-operation by the C-MOVE state machine. `len()` is
/// the `sub_op_count` spec.md §4.I refers to.
pub trait MoveRequestIterator: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Perform the next sub-operation (an outbound C-STORE), returning
    /// whether it succeeded.
    fn next(&mut self) -> Option<Result<(), OrthancError>>;
}

pub trait MoveRequestHandler: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn handle(
        &self,
        target_aet: &str,
        identifier: &Identifier,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
        originator_id: Option<u16>,
    ) -> Result<Box<dyn MoveRequestIterator>, OrthancError>;
}

/// Status of a single `do_next` step of a C-GET sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStepStatus {
    Pending,
    Success,
    Failure,
}

pub trait GetRequestHandler: Send + Sync {
    fn handle(
        &self,
        identifier: &Identifier,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> Result<bool, OrthancError>;

    /// Perform the next sub-operation in-place. The real accept loop passes
    /// in-association sub-stores through the same `ActiveAssociation` it
    /// owns; this trait leaves that plumbing to the implementation.
    fn do_next(&mut self) -> Result<GetStepStatus, OrthancError>;

    fn sub_op_count(&self) -> usize;
    fn failed_sop_instance_uids(&self) -> &[String];
}

/// Reference `StoreRequestHandler` delegating to `E` (`ResourceIndex`) —
/// spec.md §2 "delegating data to E and F".
pub struct IndexBackedStoreHandler {
    index: Arc<ResourceIndex>,
}

impl IndexBackedStoreHandler {
    pub fn new(index: Arc<ResourceIndex>) -> Self {
        IndexBackedStoreHandler { index }
    }
}

/// File content types a stored instance's attachments carry — the raw
/// transmitted bytes, plus a `DicomAsJson` cache of the parsed dataset
/// (spec.md §6) so lookups don't re-parse DICOM on every read.
const FILE_TYPE_DICOM: i64 = 1;
const FILE_TYPE_DICOM_AS_JSON: i64 = 2;

impl StoreRequestHandler for IndexBackedStoreHandler {
    fn handle(
        &self,
        bytes: &[u8],
        summary: &Identifier,
        json: &serde_json::Value,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> Result<StoreStatus, OrthancError> {
        let get_str = |tag: DicomTag| -> String {
            summary.get(&tag).and_then(|v| v.as_str()).unwrap_or("").to_string()
        };
        let patient_id = get_str(DicomTag(0x0010, 0x0020));
        let study_uid = get_str(DicomTag(0x0020, 0x000D));
        let series_uid = get_str(DicomTag(0x0020, 0x000E));
        let sop_uid = get_str(DicomTag(0x0008, 0x0018));
        let sop_class_uid = get_str(DicomTag(0x0008, 0x0016));

        let incoming = IncomingInstance {
            patient_id: &patient_id,
            study_instance_uid: &study_uid,
            series_instance_uid: &series_uid,
            sop_instance_uid: &sop_uid,
            main_tags: vec![],
            identifier_tags: summary
                .iter()
                .filter_map(|(tag, value)| value.as_str().map(|s| (ResourceLevel::Instance, *tag, s.to_string())))
                .collect(),
            attachments: vec![
                orthanc_store::IncomingAttachment {
                    file_type: FILE_TYPE_DICOM,
                    bytes: bytes.to_vec(),
                    compression: orthanc_core::CompressionType::None,
                    uncompressed_size: bytes.len() as u64,
                },
                {
                    let json_bytes = serde_json::to_vec(json).unwrap_or_default();
                    orthanc_store::IncomingAttachment {
                        file_type: FILE_TYPE_DICOM_AS_JSON,
                        uncompressed_size: json_bytes.len() as u64,
                        bytes: json_bytes,
                        compression: orthanc_core::CompressionType::None,
                    }
                },
            ],
            remote_aet,
            transfer_syntax: "1.2.840.10008.1.2.1",
            sop_class_uid: &sop_class_uid,
            index_in_series: None,
        };
        let _ = called_aet;
        let _ = remote_ip;
        let outcome = self.index.store(&incoming)?;
        Ok(match outcome.status {
            IngestStatus::AlreadyStored => StoreStatus::AlreadyStored,
            IngestStatus::Success | IngestStatus::FilteredOut => StoreStatus::Success,
        })
    }
}

/// Reference `FindRequestHandler` delegating to `E`/`D` through `DbWrapper`
/// identifier lookups.
pub struct IndexBackedFindHandler {
    index: Arc<ResourceIndex>,
    limit_find_results: usize,
}

impl IndexBackedFindHandler {
    pub fn new(index: Arc<ResourceIndex>, limit_find_results: usize) -> Self {
        IndexBackedFindHandler { index, limit_find_results }
    }
}

impl FindRequestHandler for IndexBackedFindHandler {
    fn handle(
        &self,
        answers: &mut AnswerSet,
        query: &Identifier,
        _remote_ip: &str,
        _remote_aet: &str,
        _called_aet: &str,
    ) -> Result<(), OrthancError> {
        // Patient-level find keyed on PatientID (0010,0020), the common case
        // for the Q/R models this server answers.
        let Some((tag, value)) = query
            .iter()
            .find(|(_, v)| matches!(v, TagValue::String(_)))
            .and_then(|(tag, v)| v.as_str().map(|s| (*tag, s.to_string())))
        else {
            return Ok(());
        };
        let matches: Vec<PublicId> = self
            .index
            .lookup_identifier_exact(ResourceLevel::Patient, tag, &value)
            .map_err(OrthancError::from)?;
        let limit = if self.limit_find_results == 0 { matches.len() } else { self.limit_find_results };
        for (i, public_id) in matches.into_iter().enumerate() {
            if i >= limit {
                answers.incomplete = true;
                break;
            }
            let mut identifier = Identifier::new();
            identifier.insert(tag, TagValue::String(public_id.to_string()));
            answers.push(identifier);
        }
        Ok(())
    }
}
