//! Backup target parsing and the pluggable blob-store interface.
//!
//! `BackupTarget::parse` is pure data-level validation the supervisor needs
//! at startup regardless of which store ends up handling the bytes, so it
//! is fully implemented here; only `file://` gets a concrete [`BlobStore`]
//! in this crate (`s3://` and the DigitalOcean Spaces `https://` form are
//! external collaborators that must inject their own implementation).

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

const DEFAULT_OBJECT_KEY: &str = "etcd.snapshot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupTarget {
    File { path: PathBuf },
    S3 { bucket: String, key: String },
    DigitalOceanSpaces { host: String, bucket: String, key: String },
}

impl BackupTarget {
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CoreError::Configuration("file:// backup target is missing a path".into()));
            }
            return Ok(BackupTarget::File { path: PathBuf::from(path) });
        }

        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, key) = split_bucket_key(rest);
            if bucket.is_empty() {
                return Err(CoreError::Configuration("s3:// backup target is missing a bucket".into()));
            }
            return Ok(BackupTarget::S3 {
                bucket: bucket.to_string(),
                key: key.unwrap_or(DEFAULT_OBJECT_KEY).to_string(),
            });
        }

        if let Some(rest) = url.strip_prefix("https://") {
            if let Some((host, path)) = rest.split_once('/') {
                if host.ends_with(".digitaloceanspaces.com") {
                    let (bucket, key) = split_bucket_key(path);
                    if bucket.is_empty() {
                        return Err(CoreError::Configuration(
                            "digitaloceanspaces backup target is missing a bucket".into(),
                        ));
                    }
                    return Ok(BackupTarget::DigitalOceanSpaces {
                        host: host.to_string(),
                        bucket: bucket.to_string(),
                        key: key.unwrap_or(DEFAULT_OBJECT_KEY).to_string(),
                    });
                }
            }
        }

        Err(CoreError::Configuration(format!("unsupported backup target scheme in '{url}'")))
    }
}

fn split_bucket_key(rest: &str) -> (&str, Option<&str>) {
    match rest.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (bucket, Some(key)),
        Some((bucket, _)) => (bucket, None),
        None => (rest, None),
    }
}

/// A byte-stream blob store: just enough to ship a snapshot out and pull it
/// back in. Concrete S3/Spaces clients live outside this crate; only
/// [`FileBlobStore`] is provided here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, data: &[u8]) -> Result<()>;
    async fn get(&self) -> Result<Vec<u8>>;
}

pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn get(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_target() {
        let t = BackupTarget::parse("file:///var/lib/kv/snap.db").unwrap();
        assert_eq!(t, BackupTarget::File { path: PathBuf::from("/var/lib/kv/snap.db") });
    }

    #[test]
    fn parses_s3_target_with_default_key() {
        let t = BackupTarget::parse("s3://my-bucket").unwrap();
        assert_eq!(t, BackupTarget::S3 { bucket: "my-bucket".into(), key: DEFAULT_OBJECT_KEY.into() });
    }

    #[test]
    fn parses_s3_target_with_explicit_key() {
        let t = BackupTarget::parse("s3://my-bucket/nightly.snap").unwrap();
        assert_eq!(t, BackupTarget::S3 { bucket: "my-bucket".into(), key: "nightly.snap".into() });
    }

    #[test]
    fn parses_digitalocean_spaces_target() {
        let t = BackupTarget::parse("https://nyc3.digitaloceanspaces.com/my-bucket").unwrap();
        assert_eq!(
            t,
            BackupTarget::DigitalOceanSpaces {
                host: "nyc3.digitaloceanspaces.com".into(),
                bucket: "my-bucket".into(),
                key: DEFAULT_OBJECT_KEY.into(),
            }
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(BackupTarget::parse("ftp://example.com/x").is_err());
    }

    #[tokio::test]
    async fn file_blob_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("snap.db"));
        store.put(b"hello snapshot").await.unwrap();
        let back = store.get().await.unwrap();
        assert_eq!(back, b"hello snapshot");
    }
}
