//! Result persistence.
//!
//! Every finished unit operation is written once as a [`ResultRecord`] under
//! `{id}/results.json`, either below a local results directory or below a key
//! prefix in an object store. Upload failures are reported to the caller, who
//! decides whether they matter; the dispatcher only logs them.

use crate::config::{StorageBackend, StorageConfig};
use crate::core::ExperimentResult;
use crate::error::{AppResult, EchemError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::{memory::InMemory, path::Path as ObjectPath, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File name used inside each experiment directory.
pub const RESULTS_FILE: &str = "results.json";

/// Persisted form of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The unit operation as submitted
    pub uo: Value,
    /// The stamped result
    pub results: ExperimentResult,
    /// Time the record was written
    pub timestamp: DateTime<Utc>,
    /// Technique name
    pub experiment_type: String,
}

impl ResultRecord {
    /// Wraps a result with the unit operation that produced it.
    pub fn new(uo: Value, results: ExperimentResult) -> Self {
        Self {
            experiment_type: results.uo_type.clone(),
            uo,
            results,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for experiment results.
#[async_trait]
pub trait ResultUploader: Send + Sync {
    /// Writes `record` under `experiment_id`.
    async fn upload(&self, record: &ResultRecord, experiment_id: &str) -> AppResult<()>;

    /// Reads back the record stored under `experiment_id`.
    async fn load(&self, experiment_id: &str) -> AppResult<ResultRecord>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Rejects ids that would escape the results root.
fn check_id(experiment_id: &str) -> AppResult<()> {
    let valid = !experiment_id.is_empty()
        && experiment_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EchemError::Upload(format!(
            "invalid experiment id '{experiment_id}'"
        )))
    }
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Writes `{base_dir}/{id}/results.json`.
pub struct LocalResultUploader {
    base_dir: PathBuf,
}

impl LocalResultUploader {
    #[allow(missing_docs)]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the record for `experiment_id`.
    pub fn record_path(&self, experiment_id: &str) -> PathBuf {
        self.base_dir.join(experiment_id).join(RESULTS_FILE)
    }
}

/// Reads a record from an explicit path.
pub async fn load_record(path: &Path) -> AppResult<ResultRecord> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

#[async_trait]
impl ResultUploader for LocalResultUploader {
    async fn upload(&self, record: &ResultRecord, experiment_id: &str) -> AppResult<()> {
        check_id(experiment_id)?;
        let path = self.record_path(experiment_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                EchemError::Upload(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| EchemError::Upload(format!("failed to write {}: {e}", path.display())))?;
        info!(experiment_id, path = %path.display(), "Results saved");
        Ok(())
    }

    async fn load(&self, experiment_id: &str) -> AppResult<ResultRecord> {
        check_id(experiment_id)?;
        load_record(&self.record_path(experiment_id)).await
    }

    fn describe(&self) -> String {
        self.base_dir.display().to_string()
    }
}

// ============================================================================
// Object storage
// ============================================================================

/// Writes `{prefix}/{id}/results.json` to any `object_store` backend.
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreUploader {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Uploader backed by a process-local in-memory store.
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemory::new()), prefix)
    }

    /// Uploader for an S3 bucket, credentials taken from the environment.
    #[cfg(feature = "storage_s3")]
    pub fn s3(bucket: &str, prefix: impl Into<String>) -> AppResult<Self> {
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// Object key for `experiment_id`.
    pub fn key(&self, experiment_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("{experiment_id}/{RESULTS_FILE}")
        } else {
            format!("{}/{experiment_id}/{RESULTS_FILE}", self.prefix)
        }
    }
}

#[async_trait]
impl ResultUploader for ObjectStoreUploader {
    async fn upload(&self, record: &ResultRecord, experiment_id: &str) -> AppResult<()> {
        check_id(experiment_id)?;
        let key = self.key(experiment_id);
        let body = serde_json::to_vec_pretty(record)?;
        self.store
            .put(&ObjectPath::from(key.as_str()), PutPayload::from(body))
            .await
            .map_err(|e| EchemError::Upload(format!("failed to put {key}: {e}")))?;
        info!(experiment_id, key = %key, "Results uploaded");
        Ok(())
    }

    async fn load(&self, experiment_id: &str) -> AppResult<ResultRecord> {
        check_id(experiment_id)?;
        let key = self.key(experiment_id);
        debug!(key = %key, "Fetching results");
        let bytes = self
            .store
            .get(&ObjectPath::from(key.as_str()))
            .await?
            .bytes()
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.store, self.prefix)
    }
}

/// Builds the uploader selected by the storage settings.
pub fn uploader_from_config(config: &StorageConfig) -> AppResult<Arc<dyn ResultUploader>> {
    match config.backend {
        StorageBackend::Local => Ok(Arc::new(LocalResultUploader::new(&config.results_dir))),
        StorageBackend::ObjectStore => object_store_uploader(config),
    }
}

#[cfg(feature = "storage_s3")]
fn object_store_uploader(config: &StorageConfig) -> AppResult<Arc<dyn ResultUploader>> {
    let bucket = config.bucket.as_deref().ok_or_else(|| {
        EchemError::Configuration("storage.bucket is required for object_store".to_string())
    })?;
    Ok(Arc::new(ObjectStoreUploader::s3(bucket, config.prefix.clone())?))
}

#[cfg(not(feature = "storage_s3"))]
fn object_store_uploader(_config: &StorageConfig) -> AppResult<Arc<dyn ResultUploader>> {
    Err(EchemError::Configuration(
        "object_store results need the 'storage_s3' feature. Please build with --features storage_s3"
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JsonMap;
    use serde_json::json;

    fn record() -> ResultRecord {
        let mut data = JsonMap::new();
        data.insert("voltage".into(), json!([0.5, 0.25, 1.0]));
        let result = ExperimentResult::success("OCV", data).with_id("20250101_120000_OCV_deadbeef");
        ResultRecord::new(json!({"uo_type": "OCV", "parameters": {"duration": 3}}), result)
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = LocalResultUploader::new(dir.path());
        let original = record();
        let id = "20250101_120000_OCV_deadbeef";

        uploader.upload(&original, id).await.unwrap();
        let path = dir.path().join(id).join("results.json");
        assert!(path.exists());

        assert_eq!(load_record(&path).await.unwrap(), original);
        assert_eq!(uploader.load(id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_local_layout_keys() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = LocalResultUploader::new(dir.path());
        uploader.upload(&record(), "exp_1").await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("exp_1/results.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        for key in ["uo", "results", "timestamp", "experiment_type"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["experiment_type"], json!("OCV"));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = LocalResultUploader::new(dir.path());
        let err = uploader.upload(&record(), "../escape").await.unwrap_err();
        assert!(matches!(err, EchemError::Upload(_)));
    }

    #[tokio::test]
    async fn test_object_store_round_trip() {
        let uploader = ObjectStoreUploader::in_memory("/lab/experiments/");
        assert_eq!(uploader.key("abc"), "lab/experiments/abc/results.json");
        let original = record();
        uploader.upload(&original, "abc").await.unwrap();
        assert_eq!(uploader.load("abc").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_object_store_missing_key() {
        let uploader = ObjectStoreUploader::in_memory("experiments");
        let err = uploader.load("nothing").await.unwrap_err();
        assert!(matches!(err, EchemError::ObjectStore(_)));
    }
}
