//! Attachment publishing.
//!
//! Output text is stored as a Markdown blob on the parent issue and indexed
//! in the `attachments` table with its size and SHA-256.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use conductor_core::{Error, Result};
use conductor_store::{AttachmentRecord, SqliteStore};

pub const RESULT_MIME_TYPE: &str = "text/markdown";

/// Object blob store.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn put(&self, key: &str, content: &[u8], mime_type: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename pattern"));

/// Filename for a subtask's result, derived from its human identifier.
pub fn result_filename(identifier: &str) -> String {
    let safe = UNSAFE_FILENAME_CHARS.replace_all(identifier.trim(), "-");
    let safe = safe.trim_matches('-');
    if safe.is_empty() {
        "subtask-result.md".to_string()
    } else {
        format!("{}-result.md", safe)
    }
}

pub fn attachment_key(workspace_id: &str, issue_id: &str, filename: &str) -> String {
    format!("{}/{}/{}", workspace_id, issue_id, filename)
}

pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Blob store on the local filesystem; keys map to relative paths under `root`.
pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(Error::Attachment(format!("invalid attachment key: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn put(&self, key: &str, content: &[u8], _mime_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!("Stored attachment {} ({} bytes)", key, content.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Put the blob, then index it. Returns the index row.
pub async fn publish_result(
    blobs: &dyn AttachmentStore,
    store: &Arc<SqliteStore>,
    workspace_id: &str,
    parent_issue_id: &str,
    identifier: &str,
    text: &str,
) -> Result<AttachmentRecord> {
    let filename = result_filename(identifier);
    let key = attachment_key(workspace_id, parent_issue_id, &filename);
    let content = text.as_bytes();
    blobs.put(&key, content, RESULT_MIME_TYPE).await?;

    let record = AttachmentRecord {
        workspace_id: workspace_id.to_string(),
        issue_id: parent_issue_id.to_string(),
        filename,
        storage_key: key,
        mime_type: RESULT_MIME_TYPE.to_string(),
        size_bytes: content.len() as i64,
        content_hash: content_hash(content),
    };
    store.upsert_attachment(&record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_filename() {
        assert_eq!(result_filename("MKT-2"), "MKT-2-result.md");
        assert_eq!(result_filename("  ops / 7 "), "ops-7-result.md");
        assert_eq!(result_filename("../"), "..-result.md");
        assert_eq!(result_filename("///"), "subtask-result.md");
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = FsAttachmentStore::new(tmp.path());
        let key = attachment_key("ws-1", "p-1", "MKT-2-result.md");

        blobs.put(&key, b"# Result", RESULT_MIME_TYPE).await.unwrap();
        assert_eq!(blobs.get(&key).await.unwrap().unwrap(), b"# Result");
        assert!(tmp.path().join("ws-1/p-1/MKT-2-result.md").exists());
        assert!(blobs.get("ws-1/p-1/other.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = FsAttachmentStore::new(tmp.path());
        for key in ["../x", "/etc/passwd", "a/../../b", ""] {
            let err = blobs.put(key, b"x", RESULT_MIME_TYPE).await.unwrap_err();
            assert!(matches!(err, Error::Attachment(_)), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_publish_result_indexes_blob_on_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let blobs = FsAttachmentStore::new(tmp.path());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let record = publish_result(&blobs, &store, "ws-1", "parent-1", "MKT-2", "hello")
            .await
            .unwrap();
        assert_eq!(record.storage_key, "ws-1/parent-1/MKT-2-result.md");
        assert_eq!(record.size_bytes, 5);

        let indexed = store.list_attachments("parent-1").unwrap();
        assert_eq!(indexed, vec![record]);
    }
}
