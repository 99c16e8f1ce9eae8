//! Session credential and its persisted representation.
//!
//! A [`Credential`] is either complete (token and subject both non-empty) or
//! absent. The persisted form is a single JSON blob; anything that does not
//! parse into a complete credential is discarded and counts as logged out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, ScreeningError};

/// Bearer token plus the subject identifier it was issued for.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    subject_id: String,
}

impl Credential {
    /// Builds a credential, or `None` when either part is blank.
    pub fn new(access_token: impl Into<String>, subject_id: impl Into<String>) -> Option<Self> {
        let access_token = access_token.into();
        let subject_id = subject_id.into();
        if access_token.trim().is_empty() || subject_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            access_token,
            subject_id,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Parses the persisted blob. Partial or malformed content yields `None`.
    pub fn from_blob(blob: &str) -> Option<Self> {
        let raw: PersistedCredential = serde_json::from_str(blob).ok()?;
        Self::new(raw.access_token?, raw.national_id?)
    }

    pub fn to_blob(&self) -> String {
        let persisted = PersistedCredential {
            access_token: Some(self.access_token.clone()),
            token_type: Some("bearer".to_string()),
            national_id: Some(self.subject_id.clone()),
        };
        // Plain strings always serialize.
        serde_json::to_string(&persisted).unwrap_or_default()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

/// Wire shape of the token payload; every field optional so that partial
/// blobs can be detected instead of failing deserialization outright.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCredential {
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    national_id: Option<String>,
}

/// Storage for the serialized credential blob under a known key.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn save(&self, blob: &str) -> Result<()>;
    async fn remove(&self) -> Result<()>;
}

/// Process-local credential store
#[derive(Default)]
pub struct InMemoryCredentialStore {
    blob: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.blob.lock().map(|b| b.clone()).unwrap_or_default())
    }

    async fn save(&self, blob: &str) -> Result<()> {
        let mut guard = self
            .blob
            .lock()
            .map_err(|e| ScreeningError::CredentialStore(e.to_string()))?;
        *guard = Some(blob.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let mut guard = self
            .blob
            .lock()
            .map_err(|e| ScreeningError::CredentialStore(e.to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Credential blob kept in a single file.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ScreeningError::CredentialStore(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, blob: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ScreeningError::CredentialStore(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Readers only ever see a complete blob.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await.map_err(|e| {
            ScreeningError::CredentialStore(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            ScreeningError::CredentialStore(format!(
                "failed to move credential into {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScreeningError::CredentialStore(format!(
                "failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Owns the active credential for one session and keeps the persisted copy
/// in step with it.
pub struct CredentialHolder {
    store: Arc<dyn CredentialStore>,
    current: RwLock<Option<Credential>>,
}

impl CredentialHolder {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// Reads the persisted blob and activates it when it is complete.
    /// Malformed or partial content is erased and treated as logout.
    pub async fn restore(&self) -> Result<Option<Credential>> {
        let restored = match self.store.load().await? {
            None => None,
            Some(blob) => match Credential::from_blob(&blob) {
                Some(credential) => {
                    info!(subject = %credential.subject_id(), "Restored persisted credential");
                    Some(credential)
                }
                None => {
                    warn!("Discarding malformed persisted credential");
                    self.store.remove().await?;
                    None
                }
            },
        };

        self.replace(restored.clone());
        Ok(restored)
    }

    /// Persists and activates `credential`.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        self.store.save(&credential.to_blob()).await?;
        info!(subject = %credential.subject_id(), "Credential activated");
        self.replace(Some(credential));
        Ok(())
    }

    /// Erases both the in-memory and the persisted credential.
    pub async fn clear(&self) -> Result<()> {
        self.replace(None);
        self.store.remove().await
    }

    /// Erases `credential` if it is still the active one. Returns whether
    /// anything was erased.
    pub async fn revoke(&self, credential: &Credential) -> Result<bool> {
        if self.current().as_ref() != Some(credential) {
            return Ok(false);
        }
        self.clear().await?;
        Ok(true)
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.read().map(|c| c.clone()).unwrap_or(None)
    }

    pub fn subject_id(&self) -> Option<String> {
        self.current().map(|c| c.subject_id().to_string())
    }

    pub fn is_present(&self) -> bool {
        self.current().is_some()
    }

    fn replace(&self, credential: Option<Credential>) {
        match self.current.write() {
            Ok(mut guard) => *guard = credential,
            Err(poisoned) => *poisoned.into_inner() = credential,
        }
    }
}
