use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use orthanc_core::CompressionType;

use crate::error::StoreError;

/// Content-addressed blob storage, one file per attachment. Implementations
/// never interpret bytes — compression, if any, is applied by the caller and
/// recorded alongside via `CompressionType` so it can be reversed on read.
pub trait StorageArea: Send + Sync + 'static {
    fn create(&self, uuid: &str, content: &[u8], compression: CompressionType) -> Result<(), StoreError>;
    fn read(&self, uuid: &str, compression: CompressionType) -> Result<Vec<u8>, StoreError>;
    fn remove(&self, uuid: &str) -> Result<(), StoreError>;
}

/// Stores each attachment as a file under `root`, split into two levels of
/// subdirectories taken from the first four hex characters of the uuid so no
/// single directory ends up with millions of entries.
pub struct FilesystemStorageArea {
    root: PathBuf,
}

impl FilesystemStorageArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemStorageArea { root: root.into() }
    }

    fn path_for(&self, uuid: &str) -> PathBuf {
        let mut p = self.root.clone();
        if uuid.len() >= 4 {
            p.push(&uuid[0..2]);
            p.push(&uuid[2..4]);
        }
        p.push(uuid);
        p
    }

    fn io_err(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl StorageArea for FilesystemStorageArea {
    fn create(&self, uuid: &str, content: &[u8], _compression: CompressionType) -> Result<(), StoreError> {
        let path = self.path_for(uuid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }
        let mut file = fs::File::create(&path).map_err(|e| Self::io_err(&path, e))?;
        file.write_all(content).map_err(|e| Self::io_err(&path, e))?;
        Ok(())
    }

    fn read(&self, uuid: &str, _compression: CompressionType) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(uuid);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::Core(orthanc_core::OrthancError::InexistentFile(
                    path.display().to_string(),
                ))
            } else {
                Self::io_err(&path, e)
            }
        })
    }

    fn remove(&self, uuid: &str) -> Result<(), StoreError> {
        let path = self.path_for(uuid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_content_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let area = FilesystemStorageArea::new(dir.path());
        let uuid = "ab12cd34-0000-0000-0000-000000000000";
        area.create(uuid, b"hello", CompressionType::None).unwrap();
        assert_eq!(area.read(uuid, CompressionType::None).unwrap(), b"hello");
    }

    #[test]
    fn reading_a_missing_attachment_is_inexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let area = FilesystemStorageArea::new(dir.path());
        let err = area.read("missing-uuid", CompressionType::None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Core(orthanc_core::OrthancError::InexistentFile(_))
        ));
    }

    #[test]
    fn removing_a_missing_attachment_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let area = FilesystemStorageArea::new(dir.path());
        area.remove("never-existed").unwrap();
    }
}
