use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{KeyValueStore, StorageError};

/// Extension for stored records.
const RECORD_EXT: &str = ".json";

/// Extension for in-progress writes; renamed over the record once complete.
const TEMP_EXT: &str = ".tmp";

/// Directory-backed store: each key is one file under `dir`.
///
/// Keys are percent-encoded into file names so that URLs and `:`-prefixed
/// cache keys are safe on every platform. Writes go to a temp file first and
/// are renamed into place, so a crash mid-write leaves the old value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), RECORD_EXT))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.record_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.record_path(key);
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_EXT);
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, value)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        debug!(key = key, bytes = value.len(), "Stored record");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir_key = self.dir.display().to_string();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir_key, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir_key, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(encoded) = name.strip_suffix(RECORD_EXT) else {
                continue;
            };
            if let Some(key) = decode_key(encoded) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if is_plain(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
