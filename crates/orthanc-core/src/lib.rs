pub mod error;
pub mod ids;
pub mod level;
pub mod types;

pub use error::OrthancError;
pub use ids::{InternalId, PublicId};
pub use level::ResourceLevel;
pub use types::{ChangeKind, CompressionType, IdentifierConstraint, MetadataKind};

pub mod tag;
pub use tag::{DicomTag, TagValue, ValueRepresentation};

pub type Result<T> = std::result::Result<T, OrthancError>;
