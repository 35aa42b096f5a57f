//! Short-lived credentials for object-store access.
//!
//! A `CredentialProvider` keeps one process-wide cache of credentials keyed by
//! scope. Each pipeline run takes a `CredentialLease`, which owns the on-disk
//! copy of the token and deletes it when the run ends.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::process::Command;
use crate::config::defs::{ACCESS_TOKEN_FILE, DEFAULT_REFRESH_MARGIN_SECS, DEFAULT_TOKEN_LIFETIME_SECS, GCLOUD_TAG, STDERR_TAIL_LINES};
use crate::utils::streams::tail;


#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("identity could not be verified: {0}")]
    Unverified(String),

    #[error("scope not grantable: {0}")]
    ScopeNotGrantable(String),

    #[error("grant revoked for scope {0}")]
    Revoked(String),

    #[error("credential rejected by the object store: {0}")]
    Rejected(String),

    #[error("key file error: {0}")]
    KeyFile(String),
}


/// Bearer token. Never printed: `Debug` and `Display` are redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        SecretToken(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(****)")
    }
}

impl fmt::Display for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Read,
    Write,
}

/// The storage resources a credential may touch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Scope {
    pub buckets: BTreeSet<String>,
    pub permissions: BTreeSet<Permission>,
}

impl Scope {
    pub fn new<I, S>(buckets: I, permissions: &[Permission]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            buckets: buckets.into_iter().map(Into::into).collect(),
            permissions: permissions.iter().copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() || self.permissions.is_empty()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let perms: Vec<&str> = self
            .permissions
            .iter()
            .map(|p| match p {
                Permission::Read => "read",
                Permission::Write => "write",
            })
            .collect();
        let buckets: Vec<&str> = self.buckets.iter().map(String::as_str).collect();
        write!(f, "{}:{}", perms.join(","), buckets.join(","))
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: SecretToken,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: Scope,
}

impl Credential {
    /// True once `now + margin` reaches `expires_at`.
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}


/// Source of fresh credentials. The provider serializes calls per process.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, scope: &Scope) -> Result<Credential, AuthError>;
}


fn check_grantable(grantable: &Option<BTreeSet<String>>, scope: &Scope) -> Result<(), AuthError> {
    if scope.is_empty() {
        return Err(AuthError::ScopeNotGrantable(format!("empty scope '{}'", scope)));
    }
    if let Some(allowed) = grantable {
        if let Some(bucket) = scope.buckets.iter().find(|b| !allowed.contains(*b)) {
            return Err(AuthError::ScopeNotGrantable(format!("bucket {} is not grantable", bucket)));
        }
    }
    Ok(())
}


/// Issues tokens by running an external command and reading its stdout,
/// by default `gcloud auth print-access-token`.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    pub program: String,
    pub args: Vec<String>,
    pub lifetime: Duration,
    /// Service-account key handed to gcloud instead of the ambient identity.
    pub credentials_path: Option<PathBuf>,
    pub grantable: Option<BTreeSet<String>>,
}

impl Default for CommandIssuer {
    fn default() -> Self {
        Self {
            program: GCLOUD_TAG.to_string(),
            args: vec!["auth".to_string(), "print-access-token".to_string()],
            lifetime: Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
            credentials_path: None,
            grantable: None,
        }
    }
}

#[async_trait]
impl CredentialIssuer for CommandIssuer {
    async fn issue(&self, scope: &Scope) -> Result<Credential, AuthError> {
        check_grantable(&self.grantable, scope)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(std::process::Stdio::null());
        if let Some(path) = &self.credentials_path {
            cmd.env("CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE", path);
        }
        let issued_at = Utc::now();
        let output = cmd
            .output()
            .await
            .map_err(|e| AuthError::Unverified(format!("Failed to spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr: Vec<String> = String::from_utf8_lossy(&output.stderr).lines().map(String::from).collect();
            return Err(AuthError::Unverified(tail(&stderr, STDERR_TAIL_LINES)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let token = stdout.lines().next().map(str::trim).unwrap_or_default();
        if token.is_empty() {
            return Err(AuthError::Unverified(format!("{} printed no token", self.program)));
        }

        Ok(Credential {
            token: SecretToken::new(token),
            issued_at,
            expires_at: issued_at + self.lifetime,
            scope: scope.clone(),
        })
    }
}


/// Mints random tokens locally. Backs `file://` runs, where there is no
/// remote identity, and supports revocation.
#[derive(Debug)]
pub struct EphemeralIssuer {
    lifetime: Duration,
    grantable: Option<BTreeSet<String>>,
    revoked: Mutex<HashSet<Scope>>,
    issued: AtomicUsize,
}

impl EphemeralIssuer {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            grantable: None,
            revoked: Mutex::new(HashSet::new()),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn with_grantable<I, S>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grantable = Some(buckets.into_iter().map(Into::into).collect());
        self
    }

    pub fn revoke(&self, scope: &Scope) {
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.insert(scope.clone());
        }
    }

    /// Number of tokens minted so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

impl Default for EphemeralIssuer {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS))
    }
}

#[async_trait]
impl CredentialIssuer for EphemeralIssuer {
    async fn issue(&self, scope: &Scope) -> Result<Credential, AuthError> {
        let revoked = self
            .revoked
            .lock()
            .map(|r| r.contains(scope))
            .unwrap_or(true);
        if revoked {
            return Err(AuthError::Revoked(scope.to_string()));
        }
        check_grantable(&self.grantable, scope)?;

        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        self.issued.fetch_add(1, Ordering::SeqCst);

        let issued_at = Utc::now();
        Ok(Credential {
            token: SecretToken::new(token),
            issued_at,
            expires_at: issued_at + self.lifetime,
            scope: scope.clone(),
        })
    }
}


/// Process-wide credential cache in front of an issuer.
pub struct CredentialProvider {
    issuer: Arc<dyn CredentialIssuer>,
    // Held across issuance so concurrent runs never refresh the same scope twice.
    cache: tokio::sync::Mutex<HashMap<Scope, Credential>>,
    refresh_margin: Duration,
}

impl CredentialProvider {
    pub fn new(issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self {
            issuer,
            cache: tokio::sync::Mutex::new(HashMap::new()),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Returns a valid credential for `scope`, issuing one when the cache has
    /// none or only an expired one.
    ///
    /// # Arguments
    ///
    /// * `scope` - Buckets and permissions requested.
    ///
    /// # Returns
    /// Credential, or AuthError when the identity or scope is refused.
    pub async fn acquire(&self, scope: &Scope) -> Result<Credential, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(scope) {
            if !cached.is_expired(self.refresh_margin) {
                debug!("Reusing cached credential for {}", scope);
                return Ok(cached.clone());
            }
        }
        let credential = self.issuer.issue(scope).await?;
        info!("Issued credential for {} (expires {})", scope, credential.expires_at);
        cache.insert(scope.clone(), credential.clone());
        Ok(credential)
    }

    /// Idempotent refresh: an unexpired cached credential for the same scope
    /// is returned as is; otherwise a new one is issued.
    ///
    /// # Arguments
    ///
    /// * `credential` - The credential the caller currently holds.
    ///
    /// # Returns
    /// Credential with the same scope, or AuthError if the grant was revoked.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let mut cache = self.cache.lock().await;
        let cached = cache
            .get(&credential.scope)
            .filter(|c| !c.is_expired(self.refresh_margin))
            .cloned();
        if let Some(cached) = cached {
            debug!("Refresh of {} satisfied from cache", credential.scope);
            return Ok(cached);
        }
        if !cache.contains_key(&credential.scope) && !credential.is_expired(self.refresh_margin) {
            cache.insert(credential.scope.clone(), credential.clone());
            return Ok(credential.clone());
        }
        let fresh = self.issuer.issue(&credential.scope).await?;
        info!("Refreshed credential for {} (expires {})", credential.scope, fresh.expires_at);
        cache.insert(credential.scope.clone(), fresh.clone());
        Ok(fresh)
    }

    /// Acquires a credential for one run and, when `key_dir` is given, writes
    /// its token to a file only the current user can read.
    pub async fn lease(self: &Arc<Self>, scope: &Scope, key_dir: Option<&Path>) -> Result<CredentialLease, AuthError> {
        let credential = self.acquire(scope).await?;
        let key_file = match key_dir {
            Some(dir) => Some(KeyFile::create(dir, &credential.token)?),
            None => None,
        };
        Ok(CredentialLease {
            provider: Arc::clone(self),
            current: Mutex::new(credential),
            key_file,
        })
    }
}


/// Token material on disk, mode 0600, deleted on drop.
#[derive(Debug)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn create(dir: &Path, token: &SecretToken) -> Result<Self, AuthError> {
        create_private_dir(dir).map_err(|e| AuthError::KeyFile(e.to_string()))?;
        let key_file = KeyFile { path: dir.join(ACCESS_TOKEN_FILE) };
        key_file.write(token)?;
        Ok(key_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, token: &SecretToken) -> Result<(), AuthError> {
        write_token_file(&self.path, token)
    }
}

/// Replaces `path` atomically with the token; the temp file is created 0600 by tempfile.
pub fn write_token_file(path: &Path, token: &SecretToken) -> Result<(), AuthError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AuthError::KeyFile(e.to_string()))?;
    tmp.write_all(token.expose().as_bytes())
        .and_then(|_| tmp.flush())
        .map_err(|e| AuthError::KeyFile(e.to_string()))?;
    tmp.persist(path).map_err(|e| AuthError::KeyFile(e.to_string()))?;
    Ok(())
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed key file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove key file {}: {}", self.path.display(), e),
        }
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}


/// A run's handle on its credential. The transfer adapter borrows it; only
/// the lease itself swaps in refreshed credentials.
pub struct CredentialLease {
    provider: Arc<CredentialProvider>,
    current: Mutex<Credential>,
    key_file: Option<KeyFile>,
}

impl CredentialLease {
    pub fn credential(&self) -> Credential {
        match self.current.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_file.as_ref().map(KeyFile::path)
    }

    /// Refreshes through the provider and stores the result, rewriting the key file.
    pub async fn refresh(&self) -> Result<Credential, AuthError> {
        let held = self.credential();
        let fresh = self.provider.refresh(&held).await?;
        if fresh != held {
            if let Some(key_file) = &self.key_file {
                key_file.write(&fresh.token)?;
            }
            match self.current.lock() {
                Ok(mut current) => *current = fresh.clone(),
                Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
            }
        }
        Ok(fresh)
    }

    /// Returns a credential that is safe to use now, refreshing an expired one first.
    pub async fn ensure_fresh(&self) -> Result<Credential, AuthError> {
        let held = self.credential();
        if held.is_expired(self.provider.refresh_margin()) {
            debug!("Credential for {} expired, refreshing before use", held.scope);
            self.refresh().await
        } else {
            Ok(held)
        }
    }

    /// Deletes the key file now instead of waiting for drop.
    pub fn release(mut self) {
        if let Some(key_file) = self.key_file.take() {
            drop(key_file);
        }
    }
}
