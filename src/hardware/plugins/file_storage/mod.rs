//! File-backed storage: each entry maps to `<dir>/<id><suffix>` holding the
//! raw bytes.
use std::fs;
use std::path::PathBuf;

use crate::hardware::traits::StorageBackend;

/// Stores one file per entry under a base directory.
pub struct FileStorageBackend {
    dir: PathBuf,
    suffix: String,
}

impl FileStorageBackend {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}", id, self.suffix))
    }
}

impl StorageBackend for FileStorageBackend {
    fn write(&mut self, id: u64, data: &[u8]) -> bool {
        fs::write(self.path_for(id), data).is_ok()
    }

    fn read(&mut self, id: u64) -> Option<Vec<u8>> {
        fs::read(self.path_for(id)).ok()
    }
}
