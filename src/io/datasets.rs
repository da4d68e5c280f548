//! Dataset access over an object store.
//!
//! A dataset is a JSON array of records stored under one key, with an
//! optional companion `<key>.length` marker holding its record count as
//! decimal text. Downstream stages read the marker to learn how many
//! records to expect without scanning the payload.

use crate::error::{PipelineError, Result};
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::sync::Arc;

/// A single record. Records are opaque to the orchestrator.
pub type Record = serde_json::Value;

/// Suffix of the record-count marker stored next to a dataset.
pub const LENGTH_SUFFIX: &str = ".length";

/// Key of the length marker for a dataset key.
pub fn length_key(key: &str) -> String {
    format!("{}{}", key, LENGTH_SUFFIX)
}

/// Typed access to datasets and length markers in an object store.
#[derive(Clone)]
pub struct Datasets {
    store: Arc<dyn ObjectStore>,
}

impl Datasets {
    /// Wrap an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Check whether an object exists. Read-only.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// A dataset is complete once both its payload and its length marker exist.
    pub async fn is_complete(&self, key: &str) -> Result<bool> {
        Ok(self.exists(key).await? && self.exists(&length_key(key)).await?)
    }

    /// Read the raw bytes of an object.
    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let bytes = self.store.get(&Path::from(key)).await?.bytes().await?;
        Ok(bytes)
    }

    /// Read a dataset payload as records.
    pub async fn read_records(&self, key: &str) -> Result<Vec<Record>> {
        let bytes = self.read_bytes(key).await?;
        serde_json::from_slice(&bytes).map_err(|source| PipelineError::Payload {
            key: key.to_string(),
            source,
        })
    }

    /// Write a dataset payload. Returns the number of bytes written.
    pub async fn write_records(&self, key: &str, records: &[Record]) -> Result<u64> {
        let body = serde_json::to_vec(records).map_err(|source| PipelineError::Payload {
            key: key.to_string(),
            source,
        })?;
        let written = body.len() as u64;
        self.store
            .put(&Path::from(key), PutPayload::from(body))
            .await?;
        Ok(written)
    }

    /// Read the record count recorded for a dataset.
    pub async fn read_length(&self, key: &str) -> Result<u64> {
        let marker = length_key(key);
        let bytes = self.read_bytes(&marker).await?;
        let content = String::from_utf8_lossy(&bytes);
        content
            .trim()
            .parse::<u64>()
            .map_err(|_| PipelineError::InvalidLengthMarker {
                key: marker.clone(),
                content: content.to_string(),
            })
    }

    /// Record the record count of a dataset.
    pub async fn write_length(&self, key: &str, length: u64) -> Result<()> {
        self.store
            .put(&Path::from(length_key(key)), PutPayload::from(length.to_string()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use serde_json::json;

    fn datasets() -> Datasets {
        Datasets::new(Arc::new(InMemory::new()))
    }

    #[test]
    fn test_length_key() {
        assert_eq!(length_key("out/data.json"), "out/data.json.length");
    }

    #[tokio::test]
    async fn test_exists_and_complete() {
        let ds = datasets();
        assert!(!ds.exists("a.json").await.unwrap());

        ds.write_records("a.json", &[json!(1)]).await.unwrap();
        assert!(ds.exists("a.json").await.unwrap());
        assert!(!ds.is_complete("a.json").await.unwrap());

        ds.write_length("a.json", 1).await.unwrap();
        assert!(ds.is_complete("a.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_records_roundtrip_preserves_order() {
        let ds = datasets();
        let records = vec![json!({"id": 2}), json!({"id": 1}), json!("x")];
        ds.write_records("r.json", &records).await.unwrap();
        assert_eq!(ds.read_records("r.json").await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_length_marker_is_decimal_text() {
        let ds = datasets();
        ds.write_length("d.json", 7).await.unwrap();
        let raw = ds.read_bytes("d.json.length").await.unwrap();
        assert_eq!(&raw[..], b"7");
        assert_eq!(ds.read_length("d.json").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_invalid_length_marker() {
        let ds = datasets();
        ds.store()
            .put(&Path::from("d.json.length"), PutPayload::from("seven"))
            .await
            .unwrap();
        let err = ds.read_length("d.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidLengthMarker { .. }));
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let ds = datasets();
        ds.store()
            .put(&Path::from("bad.json"), PutPayload::from("{not json"))
            .await
            .unwrap();
        let err = ds.read_records("bad.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::Payload { .. }));
    }

    #[tokio::test]
    async fn test_missing_object_is_store_error() {
        let ds = datasets();
        let err = ds.read_records("missing.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(object_store::Error::NotFound { .. })));
    }
}
