use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::intention::CacheKey;

/// Payloads of loaded assets, kept on disk across sessions.
///
/// Entries are stored under the SHA-256 of their key and written through a temporary file
/// in a sibling directory, so a reader never observes a partially written entry.
pub struct DiskCache {
    name: &'static str,
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl DiskCache {
    /// Creates a cache in `root/name`, with temporary files in `root/tmp`.
    pub fn new(name: &'static str, root: &Path) -> io::Result<Self> {
        let cache_dir = root.join(name);
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            name,
            cache_dir,
            tmp_dir,
        })
    }

    /// Creates the cache named `name`, or `None` if caching on disk is disabled.
    pub fn from_config(name: &'static str, config: &Config) -> io::Result<Option<Self>> {
        match config.cache_dir.as_deref() {
            Some(root) => Self::new(name, root).map(Some),
            None => Ok(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The location of `key`, laid out as `aa/bbccdd/eeff...`.
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        let hash = Sha256::digest(key.as_str().as_bytes());
        let hex = |bytes: &[u8]| -> String { bytes.iter().map(|b| format!("{b:02x}")).collect() };

        self.cache_dir
            .join(hex(&hash[..1]))
            .join(hex(&hash[1..4]))
            .join(hex(&hash[4..]))
    }

    /// Reads the payload stored for `key`.
    pub fn get(&self, key: &CacheKey) -> io::Result<Option<Bytes>> {
        let path = self.path(key);
        let payload = match std::fs::read(&path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        tracing::trace!("File `{}` length: {}", path.display(), payload.len());

        metric!(counter("caches.disk.hit") += 1, "cache" => self.name);
        Ok(Some(Bytes::from(payload)))
    }

    /// Stores `payload` for `key`, replacing an earlier entry.
    pub fn put(&self, key: &CacheKey, payload: &[u8]) -> io::Result<()> {
        let path = self.path(key);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

        let mut temp_file = tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)?;
        temp_file.write_all(payload)?;
        temp_file.flush()?;

        std::fs::create_dir_all(parent)?;
        temp_file.persist(&path).map_err(|err| err.error)?;

        metric!(
            histogram("caches.disk.write_size") = payload.len() as u64,
            "cache" => self.name,
        );
        Ok(())
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("name", &self.name)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}
