pub mod db;
pub mod error;
pub mod index;
pub mod storage;

pub use db::{ChangeRow, DbWrapper, DeleteOutcome, ExportRow, NewAttachment, Statistics, StoreStatus};
pub use error::StoreError;
pub use index::{Change, IncomingAttachment, IncomingInstance, IngestOutcome, IngestStatus, ResourceIndex};
pub use storage::{FilesystemStorageArea, StorageArea};
