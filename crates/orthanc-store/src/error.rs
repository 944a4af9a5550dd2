use thiserror::Error;
use orthanc_core::OrthancError;

/// Thin wrapper around the shared taxonomy, plus the handful of failure
/// modes that only make sense at the storage/database boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] OrthancError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("schema version {found} is newer than the {supported} this build understands")]
    SchemaTooNew { found: u32, supported: u32 },
}

impl From<StoreError> for OrthancError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Core(inner) => inner,
            StoreError::Sqlite(inner) => OrthancError::InternalError(inner.to_string()),
            StoreError::Io { path, source } => {
                OrthancError::CannotWriteFile(format!("{path}: {source}"))
            }
            StoreError::SchemaTooNew { found, supported } => {
                OrthancError::IncompatibleDatabaseVersion(found.max(supported))
            }
        }
    }
}
