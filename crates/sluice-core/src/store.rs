//! Blob storage port and the canonical key layout.
//!
//! The engine only needs put/get/delete/list over opaque keys; everything
//! else (providers, credentials, signed access) lives behind the
//! `object_store` trait object. Tests use the in-memory backend, the CLI a
//! local filesystem root.

use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use serde_json::Value;

/// Canonical object-store keys.
pub mod paths {
    /// `pipelines/{prun}/input.json`
    pub fn pipeline_input(pipeline_run_id: &str) -> String {
        format!("pipelines/{pipeline_run_id}/input.json")
    }

    /// `standalone/{trun}/input.json`
    pub fn standalone_input(task_run_id: &str) -> String {
        format!("standalone/{task_run_id}/input.json")
    }

    /// `runs/{prun}/outputs/{trun}.json`
    pub fn run_output(pipeline_run_id: &str, task_run_id: &str) -> String {
        format!("runs/{pipeline_run_id}/outputs/{task_run_id}.json")
    }

    /// `runs/{prun}/assets/{trun}/{key}`
    pub fn run_asset(pipeline_run_id: &str, task_run_id: &str, key: &str) -> String {
        format!("runs/{pipeline_run_id}/assets/{task_run_id}/{key}")
    }

    /// `runs/{prun}/logs/{trun}.jsonl`
    pub fn run_logs(pipeline_run_id: &str, task_run_id: &str) -> String {
        format!("runs/{pipeline_run_id}/logs/{task_run_id}.jsonl")
    }

    /// `runs/{prun}/output.json` -- the aggregated pipeline output.
    pub fn pipeline_output(pipeline_run_id: &str) -> String {
        format!("runs/{pipeline_run_id}/output.json")
    }

    /// `temp-uploads/{tmp_id}/{originalFilename}`
    pub fn temp_upload(upload_id: &str, original_filename: &str) -> String {
        format!("temp-uploads/{upload_id}/{original_filename}")
    }
}

/// Handle to the configured blob store.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").finish_non_exhaustive()
    }
}

impl BlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    /// Local filesystem store rooted at `root`.
    pub fn local(root: &FsPath) -> Result<Self> {
        let fs = object_store::local::LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("failed to open blob root {}", root.display()))?;
        Ok(Self::new(Arc::new(fs)))
    }

    /// Write raw bytes. Returns the byte count.
    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<i64> {
        let size = bytes.len() as i64;
        self.inner
            .put(&Path::from(key), PutPayload::from(bytes))
            .await
            .with_context(|| format!("failed to write blob {key}"))?;
        Ok(size)
    }

    /// Read raw bytes.
    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let result = self
            .inner
            .get(&Path::from(key))
            .await
            .with_context(|| format!("failed to read blob {key}"))?;
        let bytes = result
            .bytes()
            .await
            .with_context(|| format!("failed to read blob body {key}"))?;
        Ok(bytes.to_vec())
    }

    /// Serialize a JSON value to a key. Returns the byte count.
    pub async fn put_json(&self, key: &str, value: &Value) -> Result<i64> {
        let bytes = serde_json::to_vec(value).context("failed to serialize JSON blob")?;
        self.put_bytes(key, bytes).await
    }

    /// Read and parse a JSON value.
    pub async fn get_json(&self, key: &str) -> Result<Value> {
        let bytes = self.get_bytes(key).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("blob {key} is not valid JSON"))
    }

    /// Delete a key. Missing keys are not an error (sweeps retry).
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.inner.delete(&Path::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete blob {key}")),
        }
    }

    /// List keys under a prefix.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .inner
            .list(Some(&prefix))
            .try_collect()
            .await
            .with_context(|| format!("failed to list blobs under {prefix}"))?;
        Ok(metas.into_iter().map(|m| m.location.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_layout() {
        assert_eq!(
            paths::pipeline_input("prun_a"),
            "pipelines/prun_a/input.json"
        );
        assert_eq!(
            paths::standalone_input("trun_b"),
            "standalone/trun_b/input.json"
        );
        assert_eq!(
            paths::run_output("prun_a", "trun_b"),
            "runs/prun_a/outputs/trun_b.json"
        );
        assert_eq!(
            paths::run_asset("prun_a", "trun_b", "thumb.png"),
            "runs/prun_a/assets/trun_b/thumb.png"
        );
        assert_eq!(
            paths::run_logs("prun_a", "trun_b"),
            "runs/prun_a/logs/trun_b.jsonl"
        );
        assert_eq!(paths::pipeline_output("prun_a"), "runs/prun_a/output.json");
        assert_eq!(
            paths::temp_upload("tmp_c", "report.pdf"),
            "temp-uploads/tmp_c/report.pdf"
        );
    }

    #[tokio::test]
    async fn json_roundtrip_in_memory() {
        let store = BlobStore::in_memory();
        let value = json!({ "x": 1, "nested": { "y": [1, 2, 3] } });

        let size = store.put_json("pipelines/prun_t/input.json", &value).await.unwrap();
        assert!(size > 0);

        let back = store.get_json("pipelines/prun_t/input.json").await.unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = BlobStore::in_memory();
        store.delete("does/not/exist").await.unwrap();
    }

    #[tokio::test]
    async fn list_prefix_scopes_keys() {
        let store = BlobStore::in_memory();
        store.put_json("runs/prun_a/outputs/trun_1.json", &json!(1)).await.unwrap();
        store.put_json("runs/prun_a/outputs/trun_2.json", &json!(2)).await.unwrap();
        store.put_json("runs/prun_b/outputs/trun_3.json", &json!(3)).await.unwrap();

        let keys = store.list_prefix("runs/prun_a").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("runs/prun_a/")));
    }
}
