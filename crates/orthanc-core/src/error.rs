use thiserror::Error;

/// The error taxonomy shared by every layer of the core. Variants are kinds,
/// not exception classes — callers match on them, they never downcast.
#[derive(Debug, Clone, Error)]
pub enum OrthancError {
    #[error("not enough memory")]
    NotEnoughMemory,

    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    #[error("bad file format: {0}")]
    BadFileFormat(String),

    #[error("bad parameter type: {0}")]
    BadParameterType(String),

    #[error("inexistent item: {0}")]
    InexistentItem(String),

    #[error("inexistent file: {0}")]
    InexistentFile(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown modality: {0}")]
    UnknownModality(String),

    #[error("incompatible database version: {0}")]
    IncompatibleDatabaseVersion(u32),

    #[error("database not initialized")]
    DatabaseNotInitialized,

    #[error("null pointer")]
    NullPointer,

    #[error("bad sequence of calls: {0}")]
    BadSequenceOfCalls(String),

    #[error("parameter out of range: {0}")]
    ParameterOutOfRange(String),

    #[error("storage full")]
    FullStorage,

    #[error("cannot write file: {0}")]
    CannotWriteFile(String),

    #[error("network protocol error: {0}")]
    NetworkProtocol(String),

    #[error("job canceled")]
    CanceledJob,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl OrthancError {
    /// HTTP status the (out-of-scope) REST router would map this kind to.
    /// Pure lookup — no router is attached to this crate.
    pub fn status_code(&self) -> u16 {
        match self {
            OrthancError::NotEnoughMemory => 500,
            OrthancError::CorruptedFile(_) => 400,
            OrthancError::BadFileFormat(_) => 400,
            OrthancError::BadParameterType(_) => 400,
            OrthancError::InexistentItem(_) => 404,
            OrthancError::InexistentFile(_) => 404,
            OrthancError::UnknownResource(_) => 404,
            OrthancError::UnknownModality(_) => 404,
            OrthancError::IncompatibleDatabaseVersion(_) => 500,
            OrthancError::DatabaseNotInitialized => 503,
            OrthancError::NullPointer => 500,
            OrthancError::BadSequenceOfCalls(_) => 400,
            OrthancError::ParameterOutOfRange(_) => 400,
            OrthancError::FullStorage => 507,
            OrthancError::CannotWriteFile(_) => 500,
            OrthancError::NetworkProtocol(_) => 502,
            OrthancError::CanceledJob => 409,
            OrthancError::NotImplemented(_) => 501,
            OrthancError::InternalError(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_storage_maps_to_insufficient_storage() {
        assert_eq!(OrthancError::FullStorage.status_code(), 507);
    }

    #[test]
    fn unknown_resource_maps_to_not_found() {
        assert_eq!(OrthancError::UnknownResource("x".into()).status_code(), 404);
    }
}
