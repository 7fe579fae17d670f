//! Artifact I/O: a content-addressed object store for binary artifacts plus
//! the inline-or-blob policy for text artifacts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tokio::fs;

use super::domain::{ArtifactValue, BlobDescriptor};

/// Filesystem-backed content-addressed store. Objects live at
/// `objects/<aa>/<sha256>` under the root; the path doubles as the
/// descriptor URI. Writes are idempotent by construction.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, sha256: &str) -> PathBuf {
        self.root.join("objects").join(&sha256[..2]).join(sha256)
    }

    fn object_uri(sha256: &str) -> String {
        format!("objects/{}/{}", &sha256[..2], sha256)
    }

    /// Store bytes, returning a descriptor. Re-putting identical content is
    /// a cheap no-op.
    pub async fn put(&self, bytes: &[u8], mime: &str) -> Result<BlobDescriptor> {
        let sha256 = hex::encode(Sha256::digest(bytes));
        let path = self.object_path(&sha256);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(BlobDescriptor {
                uri: Self::object_uri(&sha256),
                mime: mime.to_string(),
                bytes: bytes.len() as u64,
                sha256,
            });
        }

        let parent = path.parent().context("object path has no parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        // Write through a temp name then rename so concurrent writers of the
        // same object never expose a partial file.
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            // A concurrent writer may have won the rename; only fail when
            // the object still does not exist.
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(e).with_context(|| format!("renaming into {}", path.display()));
            }
        }

        Ok(BlobDescriptor {
            uri: Self::object_uri(&sha256),
            mime: mime.to_string(),
            bytes: bytes.len() as u64,
            sha256,
        })
    }

    /// Fetch a blob by descriptor. The path is rebuilt from the hash, so a
    /// tampered URI cannot escape the store root.
    pub async fn get(&self, descriptor: &BlobDescriptor) -> Result<Vec<u8>> {
        if descriptor.sha256.len() != 64 || !descriptor.sha256.bytes().all(|b| b.is_ascii_hexdigit())
        {
            bail!("malformed sha256 in descriptor: {}", descriptor.sha256);
        }
        let path = self.object_path(&descriptor.sha256);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading object {}", descriptor.sha256))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != descriptor.sha256 {
            bail!(
                "object store corruption: expected {}, found {}",
                descriptor.sha256,
                actual
            );
        }
        Ok(bytes)
    }

    /// Text artifacts at or below `inline_cap` stay inline in the artifact
    /// map; larger ones are stored as `text/plain` blobs.
    pub async fn store_text(&self, text: &str, inline_cap: usize) -> Result<ArtifactValue> {
        if text.len() <= inline_cap {
            return Ok(ArtifactValue::Text(text.to_string()));
        }
        let descriptor = self.put(text.as_bytes(), "text/plain").await?;
        Ok(ArtifactValue::Blob(descriptor))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let descriptor = store.put(b"hello artifact", "video/mp4").await.unwrap();
        assert_eq!(descriptor.bytes, 14);
        assert_eq!(descriptor.mime, "video/mp4");
        assert!(descriptor.uri.starts_with("objects/"));

        let bytes = store.get(&descriptor).await.unwrap();
        assert_eq!(bytes, b"hello artifact");
    }

    #[tokio::test]
    async fn put_is_idempotent_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let a = store.put(b"same bytes", "application/octet-stream").await.unwrap();
        let b = store.put(b"same bytes", "application/octet-stream").await.unwrap();
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.uri, b.uri);
    }

    #[tokio::test]
    async fn get_rejects_tampered_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let mut descriptor = store.put(b"payload", "text/plain").await.unwrap();
        descriptor.sha256 = "../escape".into();
        assert!(store.get(&descriptor).await.is_err());
    }

    #[tokio::test]
    async fn small_text_stays_inline_large_text_becomes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());

        let small = store.store_text("short transcript", 1024).await.unwrap();
        assert!(matches!(small, ArtifactValue::Text(_)));

        let large_text = "x".repeat(2048);
        let large = store.store_text(&large_text, 1024).await.unwrap();
        let blob = large.as_blob().expect("large text should become a blob");
        assert_eq!(blob.mime, "text/plain");
        let bytes = store.get(blob).await.unwrap();
        assert_eq!(bytes.len(), 2048);
    }
}
