use std::path::Path;

use crate::{FileInfo, RandomReadFile, StorageError};

/// Local-filesystem storage backend.
#[derive(Debug, Clone, Default)]
pub struct DiskStorage;

impl DiskStorage {
    pub fn new() -> Self {
        Self
    }

    pub fn open_random_read(&self, path: &Path) -> Result<RandomReadFile, StorageError> {
        let display = path.display().to_string();
        match std::fs::File::open(path) {
            Ok(file) => {
                let len = file
                    .metadata()
                    .map_err(|source| StorageError::Transient {
                        path: display.clone(),
                        source,
                    })?
                    .len();
                Ok(RandomReadFile::new(display, file, len))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(display))
            }
            Err(err) => Err(StorageError::Transient {
                path: display,
                source: err,
            }),
        }
    }

    pub fn file_info(&self, path: &Path) -> Result<FileInfo, StorageError> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(FileInfo {
                exists: true,
                size: meta.len(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileInfo {
                exists: false,
                size: 0,
            }),
            Err(err) => Err(StorageError::Transient {
                path: path.display().to_string(),
                source: err,
            }),
        }
    }
}
