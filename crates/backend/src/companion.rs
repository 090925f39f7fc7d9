//! External object storage, used for companion files on collection rows
//! and for blob payloads declared `external`. The driver itself is a
//! collaborator behind [`ObjectStore`]; a filesystem implementation ships
//! for tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

/// Storage driver for externally kept payloads, addressed by key.
/// Pre-signed URLs grant time-limited access without credentials.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn presigned_upload_url(&self, key: &str, validity_secs: u64) -> anyhow::Result<String>;
    async fn presigned_download_url(&self, key: &str, validity_secs: u64)
        -> anyhow::Result<String>;
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Storage key of the companion file or external payload of a row.
pub fn object_key(resource: &models::Resource, id: uuid::Uuid) -> String {
    format!("{}/{}", resource.sanitized(), id)
}

/// Filesystem-backed store. "Pre-signed" URLs carry an expiry and a
/// digest over key and expiry, mimicking the shape of real object-store
/// URLs closely enough for tests.
pub struct FilesystemStore {
    root: PathBuf,
    base_url: url::Url,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>, base_url: url::Url) -> Self {
        Self {
            root: root.into(),
            base_url,
        }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn signed(&self, verb: &str, key: &str, validity_secs: u64) -> anyhow::Result<String> {
        let expires = Utc::now().timestamp() + validity_secs as i64;
        let signature = format!("{:x}", md5::compute(format!("{verb}:{key}:{expires}")));
        let mut url = self.base_url.join(key)?;
        url.query_pairs_mut()
            .append_pair("verb", verb)
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.to_string())
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn presigned_upload_url(&self, key: &str, validity_secs: u64) -> anyhow::Result<String> {
        self.signed("upload", key, validity_secs)
    }

    async fn presigned_download_url(
        &self,
        key: &str,
        validity_secs: u64,
    ) -> anyhow::Result<String> {
        self.signed("download", key, validity_secs)
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.path_of(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(
            dir.path(),
            url::Url::parse("http://storage.local/objects/").unwrap(),
        );

        store.put("fleet_device/abc", b"payload").await.unwrap();
        assert_eq!(
            store.get("fleet_device/abc").await.unwrap().as_deref(),
            Some(b"payload".as_ref())
        );

        store.delete("fleet_device/abc").await.unwrap();
        assert_eq!(store.get("fleet_device/abc").await.unwrap(), None);
        // Deleting a missing key is not an error.
        store.delete("fleet_device/abc").await.unwrap();
    }

    #[tokio::test]
    async fn presigned_urls_carry_expiry_and_signature() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(
            dir.path(),
            url::Url::parse("http://storage.local/objects/").unwrap(),
        );
        let url = store
            .presigned_download_url("fleet_device/abc", 900)
            .await
            .unwrap();
        assert!(url.starts_with("http://storage.local/objects/fleet_device/abc?"));
        assert!(url.contains("expires="));
        assert!(url.contains("signature="));
    }
}
