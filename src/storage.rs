use crate::error::{Error, ErrorDetails};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions};
use std::sync::Arc;

/// Blob storage for generated artifacts. Keys are produced by
/// [`artifact_key`] and are opaque to the store itself.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), Error>;
    async fn get(&self, key: &str) -> Result<Bytes, Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
    async fn list(&self) -> Result<Vec<String>, Error>;
}

/// Storage key for one artifact, derived from user, sequence, and creation
/// time. The sequence keeps keys unique per user; the microsecond timestamp
/// keeps concurrent attempts at the same candidate sequence apart unless
/// they land in the very same microsecond.
pub fn artifact_key(user: &str, sequence: u64, created_at: DateTime<Utc>) -> String {
    format!(
        "artifacts/{user}/{sequence:08}-{}.png",
        created_at.timestamp_micros()
    )
}

/// Adapter over the `object_store` crate (S3, GCS, local filesystem, ...).
pub struct ObjectStoreArtifacts {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreArtifacts {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArtifactStore for ObjectStoreArtifacts {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), Error> {
        let path = ObjectPath::from(key);
        let result = self
            .store
            .put_opts(
                &path,
                bytes.into(),
                PutOptions {
                    mode: PutMode::Create,
                    ..Default::default()
                },
            )
            .await;
        match result {
            // Keys embed the sequence and timestamp, so an existing object is
            // this same artifact from an earlier attempt.
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(Error::new(ErrorDetails::ObjectStoreWrite {
                message: format!("{e:?}"),
                key: key.to_string(),
            })),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        let path = ObjectPath::from(key);
        let result = self.store.get(&path).await.map_err(|e| {
            Error::new(ErrorDetails::ObjectStoreRead {
                message: format!("{e:?}"),
                key: key.to_string(),
            })
        })?;
        result.bytes().await.map_err(|e| {
            Error::new(ErrorDetails::ObjectStoreRead {
                message: format!("{e:?}"),
                key: key.to_string(),
            })
        })
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let path = ObjectPath::from(key);
        match self.store.delete(&path).await {
            // Deleting an already-gone blob is a no-op, not a failure.
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::new(ErrorDetails::ObjectStoreDelete {
                message: format!("{e:?}"),
                key: key.to_string(),
            })),
        }
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        self.store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::ObjectStoreRead {
                    message: format!("{e:?}"),
                    key: String::new(),
                })
            })
    }
}

/// Process-local blob store for tests and single-node setups.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: DashMap<String, Bytes>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), Error> {
        self.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, Error> {
        self.blobs.get(key).map(|b| b.clone()).ok_or_else(|| {
            Error::new(ErrorDetails::ObjectStoreRead {
                message: "no such object".to_string(),
                key: key.to_string(),
            })
        })
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self.blobs.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_shape() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            artifact_key("u1", 7, ts),
            "artifacts/u1/00000007-1700000000000000.png"
        );
    }

    #[test]
    fn test_artifact_keys_differ_per_sequence_and_user() {
        let ts = Utc::now();
        assert_ne!(artifact_key("u1", 1, ts), artifact_key("u1", 2, ts));
        assert_ne!(artifact_key("u1", 1, ts), artifact_key("u2", 1, ts));
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryArtifactStore::new();
        store
            .put("artifacts/u1/1.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert_eq!(
            store.get("artifacts/u1/1.png").await.unwrap(),
            Bytes::from_static(b"png")
        );

        store.delete("artifacts/u1/1.png").await.unwrap();
        assert!(store.get("artifacts/u1/1.png").await.is_err());
        // Double delete is fine.
        store.delete("artifacts/u1/1.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_object_store_adapter_round_trip() {
        let store = ObjectStoreArtifacts::new(Arc::new(object_store::memory::InMemory::new()));
        store.put("artifacts/u1/1.png", Bytes::from_static(b"png")).await.unwrap();
        // A retried put of the same key is idempotent.
        store.put("artifacts/u1/1.png", Bytes::from_static(b"png")).await.unwrap();
        assert_eq!(
            store.get("artifacts/u1/1.png").await.unwrap(),
            Bytes::from_static(b"png")
        );
        assert_eq!(store.list().await.unwrap(), vec!["artifacts/u1/1.png"]);

        store.delete("artifacts/u1/1.png").await.unwrap();
        store.delete("artifacts/u1/1.png").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
