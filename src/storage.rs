//! Byte-blob storage of computed results.
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Named byte blobs. Names are `/`-separated paths, see `codec::FileNames`.
pub trait BlobStorage: Send + Sync {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// `Ok(None)` when no blob of that name was saved.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Blobs kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Sorted names of the stored blobs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().remove(name)
    }
}

impl BlobStorage for MemoryStorage {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }
}

/// Blobs stored as files under a root directory, missing directories are created on save.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BlobStorage for DirectoryStorage {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let storage_error = |source: io::Error| Error::Storage {
            name: name.to_string(),
            source,
        };
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }
        fs::write(&path, bytes).map_err(storage_error)
    }

    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Storage {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{BlobStorage, DirectoryStorage, MemoryStorage};
    use crate::error::{Error, Result};
    use std::fs;
    use std::io;
    use std::sync::Arc;

    /// Memory storage whose saves of one blob fail.
    pub(crate) struct FailingStorage {
        pub(crate) inner: Arc<MemoryStorage>,
        pub(crate) failing: String,
    }

    impl BlobStorage for FailingStorage {
        fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
            if name == self.failing {
                return Err(Error::Storage {
                    name: name.to_string(),
                    source: io::Error::other("disk full"),
                });
            }
            self.inner.save(name, bytes)
        }

        fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
            self.inner.load(name)
        }
    }

    #[test]
    fn memory_storage() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());
        storage.save("channel/b", &[1, 2]).unwrap();
        storage.save("channel/a", &[3]).unwrap();
        storage.save("channel/b", &[4]).unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.names(), vec!["channel/a", "channel/b"]);
        assert_eq!(storage.load("channel/b").unwrap(), Some(vec![4]));
        assert_eq!(storage.load("channel/c").unwrap(), None);
        assert_eq!(storage.remove("channel/a"), Some(vec![3]));
        assert_eq!(storage.load("channel/a").unwrap(), None);
    }

    #[test]
    fn directory_storage() {
        let root = std::env::temp_dir().join(format!("stack-slic-storage-{}", std::process::id()));
        let storage = DirectoryStorage::new(&root);
        assert_eq!(storage.load("ch0/missing.bin").unwrap(), None);
        storage.save("ch0/nested/blob.bin", &[7, 8, 9]).unwrap();
        assert_eq!(
            storage.load("ch0/nested/blob.bin").unwrap(),
            Some(vec![7, 8, 9])
        );
        assert!(root.join("ch0").join("nested").join("blob.bin").is_file());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn failing_storage_keeps_other_blobs() {
        let inner = Arc::new(MemoryStorage::new());
        let storage = FailingStorage {
            inner: inner.clone(),
            failing: "ch/b".to_string(),
        };
        storage.save("ch/a", &[1]).unwrap();
        assert!(matches!(
            storage.save("ch/b", &[2]),
            Err(Error::Storage { .. })
        ));
        assert_eq!(inner.names(), vec!["ch/a"]);
    }
}
