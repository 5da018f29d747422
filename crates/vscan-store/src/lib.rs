#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod codec;
pub mod disk;
pub mod paths;

use std::path::Path;

use thiserror::Error;

use vscan_observe::time::unix_time_ms;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file does not exist: {0}")]
    NotFound(String),
    #[error("transient storage failure on {path}: {source}")]
    Transient {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("short read at offset {offset} of {path}")]
    ShortRead { path: String, offset: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Existence probe used to gate the preprocessing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub exists: bool,
    pub size: u64,
}

/// Storage backends the pipeline can read from, dispatched once per open.
#[derive(Debug, Clone)]
pub enum Storage {
    Disk(disk::DiskStorage),
}

impl Storage {
    pub fn disk() -> Self {
        Storage::Disk(disk::DiskStorage::new())
    }

    pub fn open_random_read(&self, path: &Path) -> Result<RandomReadFile, StorageError> {
        match self {
            Storage::Disk(d) => d.open_random_read(path),
        }
    }

    pub fn file_info(&self, path: &Path) -> Result<FileInfo, StorageError> {
        match self {
            Storage::Disk(d) => d.file_info(path),
        }
    }
}

/// A seekable byte stream opened for random reads.
///
/// Each worker opens its own handle, so methods take `&mut self` and no
/// cross-thread position sharing exists.
#[derive(Debug)]
pub struct RandomReadFile {
    path: String,
    file: std::fs::File,
    len: u64,
}

impl RandomReadFile {
    pub(crate) fn new(path: String, file: std::fs::File, len: u64) -> Self {
        Self { path, file, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        use std::io::{Read, Seek, SeekFrom};

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                StorageError::ShortRead {
                    path: self.path.clone(),
                    offset,
                }
            } else {
                StorageError::Io(err)
            }
        })
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>, StorageError> {
        use std::io::{Read, Seek, SeekFrom};

        self.file.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.file.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Write `bytes` to `path` through a same-directory temp file plus rename, so
/// readers never observe a partially written artifact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path must have parent",
        ))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!("tmp.{}.{}", std::process::id(), unix_time_ms());
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad filename",
        ))
    })?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
