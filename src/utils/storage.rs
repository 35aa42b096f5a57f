//! Object-store backends: `gs://` through gsutil, `file://` on the local disk.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::config::defs::{PipelineError, GSUTIL_TAG, STDERR_TAIL_LINES};
use crate::utils::credentials::CredentialLease;
use crate::utils::streams::tail;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Gs,
    File,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Gs => "gs",
            Scheme::File => "file",
        }
    }
}


/// `scheme://bucket/key`. For `file://` URIs the bucket is the first
/// directory under `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    pub scheme: Scheme,
    pub bucket: String,
    pub key: String,
}

impl RemotePath {
    /// Locations ending in `/` (or naming a bare bucket) are prefixes that
    /// receive artifacts under their own file names.
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().filter(|n| !n.is_empty())
    }

    pub fn join(&self, name: &str) -> RemotePath {
        let key = if self.key.is_empty() || self.key.ends_with('/') {
            format!("{}{}", self.key, name)
        } else {
            format!("{}/{}", self.key, name)
        };
        RemotePath { key, ..self.clone() }
    }

    pub fn with_suffix(&self, suffix: &str) -> RemotePath {
        RemotePath { key: format!("{}{}", self.key, suffix), ..self.clone() }
    }

    /// Same object with `old` replaced by `new` at the end of the key.
    pub fn replace_suffix(&self, old: &str, new: &str) -> Option<RemotePath> {
        self.key
            .strip_suffix(old)
            .map(|stem| RemotePath { key: format!("{}{}", stem, new), ..self.clone() })
    }

    /// Filesystem path of a `file://` location.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.scheme {
            Scheme::File => Some(PathBuf::from(format!("/{}/{}", self.bucket, self.key))),
            Scheme::Gs => None,
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Gs => write!(f, "gs://{}/{}", self.bucket, self.key),
            Scheme::File => write!(f, "file:///{}/{}", self.bucket, self.key),
        }
    }
}

impl FromStr for RemotePath {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("gs://") {
            (Scheme::Gs, rest)
        } else if let Some(rest) = s.strip_prefix("file://") {
            (Scheme::File, rest.trim_start_matches('/'))
        } else {
            return Err(PipelineError::InvalidConfig(format!(
                "Unsupported location '{}': expected gs:// or file://",
                s
            )));
        };
        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(PipelineError::InvalidConfig(format!("Missing bucket in '{}'", s)));
        }
        if key.split('/').any(|part| part == "..") {
            return Err(PipelineError::InvalidConfig(format!("Parent components are not allowed in '{}'", s)));
        }
        Ok(RemotePath {
            scheme,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}


/// Raw outcome classes a backend reports; the transfer adapter decides
/// which of them are retried.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Transient(String),
    Unauthorized(String),
    NotFound(String),
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(m) => write!(f, "transient failure: {}", m),
            StoreError::Unauthorized(m) => write!(f, "unauthorized: {}", m),
            StoreError::NotFound(m) => write!(f, "not found: {}", m),
            StoreError::Io(m) => write!(f, "I/O failure: {}", m),
        }
    }
}


/// Upload, download, existence and checksum: the only interactions the
/// pipeline has with object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, remote: &RemotePath, local: &Path, lease: &CredentialLease) -> Result<(), StoreError>;

    async fn upload(&self, local: &Path, remote: &RemotePath, lease: &CredentialLease) -> Result<(), StoreError>;

    async fn exists(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<bool, StoreError>;

    async fn remote_checksum(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<String, StoreError>;

    async fn local_checksum(&self, local: &Path) -> Result<String, StoreError>;
}


/// Cloud storage through the gsutil binary. The lease's key file is handed
/// over via `CLOUDSDK_AUTH_ACCESS_TOKEN_FILE`.
#[derive(Debug, Clone)]
pub struct GsutilStore {
    pub program: String,
    pub project: Option<String>,
}

impl Default for GsutilStore {
    fn default() -> Self {
        Self {
            program: GSUTIL_TAG.to_string(),
            project: None,
        }
    }
}

/// Sorts gsutil's stderr into the outcome classes.
pub fn classify_gsutil_error(stderr: &str) -> StoreError {
    let lower = stderr.to_lowercase();
    let unauthorized = ["401", "403", "accessdenied", "access denied", "unauthorized", "invalid credentials", "does not have storage."];
    let not_found = ["no urls matched", "404", "not found", "notfound"];
    // Failures of the local side; retrying cannot help.
    let local = [
        "no space left on device",
        "disk quota exceeded",
        "permission denied",
        "read-only file system",
        "no such file or directory",
        "is a directory",
    ];
    let message = tail(&stderr.lines().map(String::from).collect::<Vec<_>>(), STDERR_TAIL_LINES);
    if unauthorized.iter().any(|p| lower.contains(p)) {
        StoreError::Unauthorized(message)
    } else if not_found.iter().any(|p| lower.contains(p)) {
        StoreError::NotFound(message)
    } else if local.iter().any(|p| lower.contains(p)) {
        StoreError::Io(message)
    } else {
        StoreError::Transient(message)
    }
}

/// Pulls the CRC32C out of `gsutil hash -h -c` output.
pub fn parse_gsutil_hash(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|l| l.trim_start().starts_with("Hash (crc32c):"))
        .and_then(|l| l.split(':').nth(1))
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
}

impl GsutilStore {
    async fn run(&self, args: &[&str], lease: Option<&CredentialLease>) -> Result<std::process::Output, StoreError> {
        debug!("{} {:?}", self.program, args);
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(std::process::Stdio::null());
        if let Some(key_path) = lease.and_then(CredentialLease::key_path) {
            cmd.env("CLOUDSDK_AUTH_ACCESS_TOKEN_FILE", key_path);
        }
        if let Some(project) = &self.project {
            cmd.env("CLOUDSDK_CORE_PROJECT", project);
        }
        cmd.output()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to spawn {}: {}", self.program, e)))
    }

    async fn run_checked(&self, args: &[&str], lease: Option<&CredentialLease>) -> Result<String, StoreError> {
        let output = self.run(args, lease).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_gsutil_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl ObjectStore for GsutilStore {
    async fn download(&self, remote: &RemotePath, local: &Path, lease: &CredentialLease) -> Result<(), StoreError> {
        let remote = remote.to_string();
        let local = local.to_string_lossy().into_owned();
        self.run_checked(&["-q", "cp", remote.as_str(), local.as_str()], Some(lease)).await.map(|_| ())
    }

    async fn upload(&self, local: &Path, remote: &RemotePath, lease: &CredentialLease) -> Result<(), StoreError> {
        let remote = remote.to_string();
        let local = local.to_string_lossy().into_owned();
        self.run_checked(&["-q", "cp", local.as_str(), remote.as_str()], Some(lease)).await.map(|_| ())
    }

    async fn exists(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<bool, StoreError> {
        let remote = remote.to_string();
        let output = self.run(&["-q", "stat", remote.as_str()], Some(lease)).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // `stat -q` exits 1 silently for a missing object
        if stderr.trim().is_empty() {
            return Ok(false);
        }
        match classify_gsutil_error(&stderr) {
            StoreError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    async fn remote_checksum(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<String, StoreError> {
        let remote = remote.to_string();
        let stdout = self.run_checked(&["hash", "-h", "-c", remote.as_str()], Some(lease)).await?;
        parse_gsutil_hash(&stdout).ok_or_else(|| StoreError::Io(format!("No crc32c reported for {}", remote)))
    }

    async fn local_checksum(&self, local: &Path) -> Result<String, StoreError> {
        let local = local.to_string_lossy().into_owned();
        let stdout = self.run_checked(&["hash", "-h", "-c", local.as_str()], None).await?;
        parse_gsutil_hash(&stdout).ok_or_else(|| StoreError::Io(format!("No crc32c reported for {}", local)))
    }
}


/// `file://` locations on a mounted filesystem, checksummed with BLAKE3.
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

fn io_to_store(path: &Path, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(path.display().to_string())
    } else {
        StoreError::Io(format!("{}: {}", path.display(), e))
    }
}

fn file_path(remote: &RemotePath) -> Result<PathBuf, StoreError> {
    remote
        .local_path()
        .ok_or_else(|| StoreError::Io(format!("{} is not a file:// location", remote)))
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), StoreError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_to_store(parent, e))?;
    }
    tokio::fs::copy(from, to).await.map_err(|e| io_to_store(from, e))?;
    Ok(())
}

/// BLAKE3 of a file, hex encoded.
pub async fn blake3_file(path: &Path) -> Result<String, StoreError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&owned).map_err(|e| io_to_store(&owned, e))?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| io_to_store(&owned, e))?;
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await
    .map_err(|e| StoreError::Io(e.to_string()))?
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn download(&self, remote: &RemotePath, local: &Path, _lease: &CredentialLease) -> Result<(), StoreError> {
        copy_file(&file_path(remote)?, local).await
    }

    async fn upload(&self, local: &Path, remote: &RemotePath, _lease: &CredentialLease) -> Result<(), StoreError> {
        copy_file(local, &file_path(remote)?).await
    }

    async fn exists(&self, remote: &RemotePath, _lease: &CredentialLease) -> Result<bool, StoreError> {
        let path = file_path(remote)?;
        tokio::fs::try_exists(&path).await.map_err(|e| io_to_store(&path, e))
    }

    async fn remote_checksum(&self, remote: &RemotePath, _lease: &CredentialLease) -> Result<String, StoreError> {
        blake3_file(&file_path(remote)?).await
    }

    async fn local_checksum(&self, local: &Path) -> Result<String, StoreError> {
        blake3_file(local).await
    }
}
