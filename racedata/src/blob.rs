//! Durable blob storage backing the second cache tier. Objects are opaque bytes
//! with last-modified metadata kept by the backend itself, which is what cache
//! freshness is measured against.

use crate::config::{BlobStoreType, Compression};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

/// Outcome of a conditional read.
#[derive(Debug, PartialEq)]
pub enum BlobRead {
    Found(Bytes),
    NotFound,
    /// The object exists but was last modified before the requested instant.
    NotModified,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the object stored under `key` if it was modified at or after `since`.
    async fn get_if_modified_since(&self, key: &str, since: SystemTime)
    -> Result<BlobRead, BlobError>;

    /// Creates or overwrites the object stored under `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;
}

pub fn get_blob_store(store_type: &BlobStoreType) -> Arc<dyn BlobStore> {
    match store_type {
        BlobStoreType::Filesystem { base_dir } => Arc::new(FilesystemBlobStore::new(base_dir)),
        BlobStoreType::Memory => Arc::new(MemoryBlobStore::new()),
    }
}

/// Serializes cached values with bincode, optionally zstd compressed.
pub struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    pub fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, BlobError> {
        let mut buffer = Vec::new();
        self.write(&mut buffer, value)?;
        Ok(Bytes::from(buffer))
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, BlobError> {
        self.read(data)
    }

    fn write<W: Write, T: Serialize>(&self, writer: &mut W, value: &T) -> Result<usize, BlobError> {
        match self.compression.zstd_level() {
            None => {
                let size = bincode::serde::encode_into_std_write(value, writer, self.config)?;
                writer.flush()?;
                Ok(size)
            }
            Some(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                let size = bincode::serde::encode_into_std_write(value, &mut encoder, self.config)?;
                encoder.finish()?;
                Ok(size)
            }
        }
    }

    fn read<R: Read, T: DeserializeOwned>(&self, mut reader: R) -> Result<T, BlobError> {
        match self.compression.zstd_level() {
            None => Ok(bincode::serde::decode_from_std_read(
                &mut reader,
                self.config,
            )?),
            Some(_) => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(bincode::serde::decode_from_std_read(
                    &mut decoder,
                    self.config,
                )?)
            }
        }
    }
}

/// Stores each object as a file under `base_dir`, using the file's mtime as
/// last-modified.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        FilesystemBlobStore {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let invalid = key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "..");
        if invalid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn get_if_modified_since(
        &self,
        key: &str,
        since: SystemTime,
    ) -> Result<BlobRead, BlobError> {
        let path = self.path_for(key)?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BlobRead::NotFound),
            Err(e) => return Err(e.into()),
        };

        if metadata.modified()? < since {
            return Ok(BlobRead::NotModified);
        }

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(BlobRead::Found(Bytes::from(data))),
            // Removed between the metadata and read calls.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BlobRead::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a partial object.
        let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(path = %path.display(), bytes = data.len(), "stored blob");
        Ok(())
    }
}

/// Process-local blob store, for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, (Bytes, SystemTime)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object with an explicit last-modified time.
    pub fn put_with_modified(&self, key: &str, data: Bytes, modified: SystemTime) {
        self.objects
            .write()
            .insert(key.to_string(), (data, modified));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_if_modified_since(
        &self,
        key: &str,
        since: SystemTime,
    ) -> Result<BlobRead, BlobError> {
        let objects = self.objects.read();
        Ok(match objects.get(key) {
            None => BlobRead::NotFound,
            Some((_, modified)) if *modified < since => BlobRead::NotModified,
            Some((data, _)) => BlobRead::Found(data.clone()),
        })
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        self.put_with_modified(key, data, SystemTime::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Track;
    use std::time::Duration;

    fn tracks() -> Vec<Track> {
        vec![
            Track {
                track_id: 1,
                track_name: "Lime Rock".into(),
                config_name: None,
                category: "road".into(),
                track_config_length: 1.53,
                corners_per_lap: 7,
            },
            Track {
                track_id: 2,
                track_name: "Daytona".into(),
                config_name: Some("Oval".into()),
                category: "oval".into(),
                track_config_length: 2.5,
                corners_per_lap: 4,
            },
        ]
    }

    #[test]
    fn test_codec() {
        for compression in [Compression::None, Compression::Zstd1, Compression::Zstd3] {
            let codec = Codec::new(compression);
            let encoded = codec.encode(&tracks()).unwrap();
            let decoded: Vec<Track> = codec.decode(&encoded).unwrap();
            assert_eq!(decoded, tracks());
        }
    }

    #[test]
    fn test_codec_rejects_garbage() {
        let codec = Codec::new(Compression::Zstd1);
        assert!(codec.decode::<Vec<Track>>(b"not zstd").is_err());
    }

    #[tokio::test]
    async fn test_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        let before = SystemTime::now() - Duration::from_secs(60);

        assert_eq!(
            store
                .get_if_modified_since("catalog/tracks", before)
                .await
                .unwrap(),
            BlobRead::NotFound
        );

        store
            .put("catalog/tracks", Bytes::from_static(b"payload"))
            .await
            .unwrap();

        assert_eq!(
            store
                .get_if_modified_since("catalog/tracks", before)
                .await
                .unwrap(),
            BlobRead::Found(Bytes::from_static(b"payload"))
        );

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(
            store
                .get_if_modified_since("catalog/tracks", future)
                .await
                .unwrap(),
            BlobRead::NotModified
        );
    }

    #[tokio::test]
    async fn test_filesystem_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());

        for key in ["", "/etc/passwd", "../outside", "catalog//tracks"] {
            assert!(matches!(
                store.put(key, Bytes::new()).await,
                Err(BlobError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_modified_since() {
        let store = MemoryBlobStore::new();
        let now = SystemTime::now();
        store.put_with_modified("k", Bytes::from_static(b"v"), now - Duration::from_secs(120));

        assert_eq!(
            store
                .get_if_modified_since("k", now - Duration::from_secs(60))
                .await
                .unwrap(),
            BlobRead::NotModified
        );
        assert_eq!(
            store
                .get_if_modified_since("k", now - Duration::from_secs(300))
                .await
                .unwrap(),
            BlobRead::Found(Bytes::from_static(b"v"))
        );
    }
}
