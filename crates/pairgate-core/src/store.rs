//! On-disk session directories and the credential files inside them.
//!
//! Every pairing session owns one directory under the sessions root. The
//! directory is created before the engine is opened and removed on every
//! terminal path; removal tolerates a missing directory so that competing
//! cleanup paths never fail each other.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rand::RngCore;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::engine::Jid;
use crate::errors::{PairingError, PairingResult};

/// File holding the engine's credential document.
pub const CREDS_FILE: &str = "creds.json";

/// Correlation id of a pairing session: `session_<unix millis>_<random hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        Self(format!(
            "session_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            hex::encode(suffix)
        ))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates and removes per-session directories under a shared root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the root exists, then create a fresh directory for `id`.
    ///
    /// An existing directory for the same id is an error, never reused.
    pub async fn create(&self, id: &SessionId) -> PairingResult<PathBuf> {
        fs::create_dir_all(&self.root).await?;

        let dir = self.root.join(id.as_str());
        match fs::create_dir(&dir).await {
            Ok(()) => {
                debug!(session_id = %id, dir = %dir.display(), "created session directory");
                Ok(dir)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PairingError::SessionExists(dir)),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively delete `dir`. Returns `false` when it was already gone.
    pub async fn remove(&self, dir: &Path) -> PairingResult<bool> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "removed session directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Credential state persisted by the engine inside a session directory.
///
/// `creds.json` holds the credential document; key material lives in
/// sibling files named after the engine's key ids.
#[derive(Debug, Clone)]
pub struct CredentialFiles {
    dir: PathBuf,
}

impl CredentialFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn creds_path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }

    /// Parsed `creds.json`, or `None` on a fresh session.
    pub async fn load_creds(&self) -> PairingResult<Option<Value>> {
        match fs::read(self.creds_path()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Raw bytes of `creds.json` as stored on disk.
    pub async fn read_creds_raw(&self) -> PairingResult<Option<Bytes>> {
        match fs::read(self.creds_path()).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace `creds.json`. Readers never observe a half-written file.
    pub async fn save_creds(&self, creds: &Value) -> PairingResult<()> {
        let raw = serde_json::to_vec_pretty(creds)?;
        let tmp = self.dir.join(format!("{CREDS_FILE}.tmp"));
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, self.creds_path()).await?;
        Ok(())
    }

    pub async fn write_key(&self, name: &str, data: &[u8]) -> PairingResult<()> {
        let path = self.dir.join(key_file_name(name)?);
        fs::write(path, data).await?;
        Ok(())
    }

    pub async fn read_key(&self, name: &str) -> PairingResult<Option<Bytes>> {
        let path = self.dir.join(key_file_name(name)?);
        match fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Account identity recorded in `creds.json` (`me.id`), normalized.
    pub async fn identity(&self) -> PairingResult<Option<Jid>> {
        let creds = self.load_creds().await?;
        Ok(creds
            .as_ref()
            .and_then(|c| c.pointer("/me/id"))
            .and_then(Value::as_str)
            .map(Jid::normalize))
    }
}

/// Map an engine key id onto a single path component.
fn key_file_name(name: &str) -> PairingResult<String> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(PairingError::InvalidKeyName(name.to_string()));
    }
    let file = name.replace(['/', '\\'], "__").replace(':', "-");
    Ok(format!("{file}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session_"));
    }

    #[tokio::test]
    async fn test_create_materializes_root_and_session_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));

        let dir = store.create(&SessionId::new("s1")).await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.parent().unwrap(), store.root());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_session_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let id = SessionId::new("dup");

        store.create(&id).await.unwrap();
        let err = store.create(&id).await.unwrap_err();
        assert!(matches!(err, PairingError::SessionExists(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let dir = store.create(&SessionId::new("gone")).await.unwrap();
        CredentialFiles::new(&dir)
            .save_creds(&json!({"registered": false}))
            .await
            .unwrap();

        assert!(store.remove(&dir).await.unwrap());
        assert!(!store.remove(&dir).await.unwrap());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_recreated_session_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let id = SessionId::new("again");

        let dir = store.create(&id).await.unwrap();
        CredentialFiles::new(&dir)
            .save_creds(&json!({"me": {"id": "1@s.whatsapp.net"}}))
            .await
            .unwrap();
        store.remove(&dir).await.unwrap();

        let dir = store.create(&id).await.unwrap();
        assert!(CredentialFiles::new(&dir).load_creds().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_creds_round_trip_and_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let files = CredentialFiles::new(tmp.path());
        assert!(files.identity().await.unwrap().is_none());

        files
            .save_creds(&json!({"me": {"id": "15550001111:7@s.whatsapp.net"}}))
            .await
            .unwrap();

        let creds = files.load_creds().await.unwrap().unwrap();
        assert_eq!(creds["me"]["id"], "15550001111:7@s.whatsapp.net");
        assert_eq!(
            files.identity().await.unwrap().unwrap().as_str(),
            "15550001111@s.whatsapp.net"
        );
        assert!(!tmp.path().join("creds.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_key_files_use_sanitized_names() {
        let tmp = tempfile::tempdir().unwrap();
        let files = CredentialFiles::new(tmp.path());

        files.write_key("session-1:2/a", b"key").await.unwrap();
        assert!(tmp.path().join("session-1-2__a.json").is_file());
        assert_eq!(
            files.read_key("session-1:2/a").await.unwrap().unwrap(),
            Bytes::from_static(b"key")
        );
        assert!(files.read_key("missing").await.unwrap().is_none());
        assert!(matches!(
            files.write_key("..", b"x").await,
            Err(PairingError::InvalidKeyName(_))
        ));
    }
}
