//! Transfers between the object store and the local scratch space, with
//! bounded retries and checksum verification.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use crate::config::defs::{PipelineError, DEFAULT_MAX_RETRIES, DOWNLOAD_STEP, UPLOAD_STEP};
use crate::pipelines::run::StageResult;
use crate::utils::credentials::{AuthError, CredentialLease};
use crate::utils::storage::{ObjectStore, RemotePath, StoreError};


#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("network failure on {path} after {attempts} attempts: {message}")]
    Network {
        path: String,
        attempts: u32,
        message: String,
    },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O failure on {path}: {message}")]
    Io {
        path: String,
        message: String,
    },
}


/// Retry budget for transient network failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^retry`, capped at `max_delay`, plus up to 10% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        }
    }
}


enum Op<'a> {
    Download(&'a RemotePath, &'a Path),
    Upload(&'a Path, &'a RemotePath),
    Exists(&'a RemotePath),
    RemoteChecksum(&'a RemotePath),
}

enum OpOutput {
    Done,
    Exists(bool),
    Checksum(String),
}

impl Op<'_> {
    fn target(&self) -> String {
        match self {
            Op::Download(remote, _) | Op::Exists(remote) | Op::RemoteChecksum(remote) => remote.to_string(),
            Op::Upload(_, remote) => remote.to_string(),
        }
    }
}

impl fmt::Display for Op<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Download(remote, local) => write!(f, "download {} -> {}", remote, local.display()),
            Op::Upload(local, remote) => write!(f, "upload {} -> {}", local.display(), remote),
            Op::Exists(remote) => write!(f, "stat {}", remote),
            Op::RemoteChecksum(remote) => write!(f, "checksum {}", remote),
        }
    }
}


/// Moves objects for one run. The adapter never owns a credential: it
/// borrows the run's lease and asks it to refresh.
#[derive(Clone)]
pub struct TransferAdapter {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl TransferAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call(&self, op: &Op<'_>, lease: &CredentialLease) -> Result<OpOutput, StoreError> {
        match op {
            Op::Download(remote, local) => self.store.download(remote, local, lease).await.map(|_| OpOutput::Done),
            Op::Upload(local, remote) => self.store.upload(local, remote, lease).await.map(|_| OpOutput::Done),
            Op::Exists(remote) => self.store.exists(remote, lease).await.map(OpOutput::Exists),
            Op::RemoteChecksum(remote) => self.store.remote_checksum(remote, lease).await.map(OpOutput::Checksum),
        }
    }

    /// Runs one store operation under the retry rules: transient failures
    /// back off up to `max_retries` times, an authorization failure gets one
    /// credential refresh and one more try, anything else surfaces at once.
    async fn call_with_retries(&self, op: &Op<'_>, lease: &CredentialLease) -> Result<OpOutput, PipelineError> {
        let mut retries = 0u32;
        let mut refreshed = false;
        loop {
            lease.ensure_fresh().await?;
            match self.call(op, lease).await {
                Ok(output) => return Ok(output),
                Err(StoreError::Transient(message)) if retries < self.policy.max_retries => {
                    let delay = self.policy.backoff(retries);
                    retries += 1;
                    warn!(
                        "{} failed ({}); retry {}/{} in {} ms",
                        op, message, retries, self.policy.max_retries, delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Err(StoreError::Transient(message)) => {
                    return Err(TransferError::Network {
                        path: op.target(),
                        attempts: retries + 1,
                        message,
                    }
                    .into());
                }
                Err(StoreError::Unauthorized(message)) if !refreshed => {
                    refreshed = true;
                    warn!("{} was refused ({}); refreshing credential and retrying once", op, message);
                    lease.refresh().await?;
                }
                Err(StoreError::Unauthorized(message)) => {
                    return Err(AuthError::Rejected(format!("{}: {}", op.target(), message)).into());
                }
                Err(StoreError::NotFound(message)) => {
                    return Err(TransferError::NotFound(if message.is_empty() { op.target() } else { message }).into());
                }
                Err(StoreError::Io(message)) => {
                    return Err(TransferError::Io { path: op.target(), message }.into());
                }
            }
        }
    }

    async fn remote_checksum(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<String, PipelineError> {
        match self.call_with_retries(&Op::RemoteChecksum(remote), lease).await? {
            OpOutput::Checksum(sum) => Ok(sum),
            _ => Err(PipelineError::IOError(format!("No checksum returned for {}", remote))),
        }
    }

    async fn local_checksum(&self, local: &Path) -> Result<String, PipelineError> {
        self.store.local_checksum(local).await.map_err(|e| {
            PipelineError::from(TransferError::Io {
                path: local.display().to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Checks whether an object is present.
    pub async fn exists(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<bool, PipelineError> {
        match self.call_with_retries(&Op::Exists(remote), lease).await? {
            OpOutput::Exists(found) => Ok(found),
            _ => Err(PipelineError::IOError(format!("No existence answer for {}", remote))),
        }
    }

    /// Copies one object into the scratch space and verifies its checksum.
    ///
    /// # Arguments
    ///
    /// * `remote` - Source object.
    /// * `local` - Destination under the run's working directory.
    /// * `lease` - The run's credential.
    ///
    /// # Returns
    /// StageResult listing `local`, or a TransferError/AuthError. A checksum
    /// mismatch is re-downloaded once; a second mismatch is an error.
    pub async fn download(&self, remote: &RemotePath, local: &Path, lease: &CredentialLease) -> Result<StageResult, PipelineError> {
        let start = Instant::now();
        let mut reattempted = false;
        loop {
            debug!("Downloading {} to {}", remote, local.display());
            self.call_with_retries(&Op::Download(remote, local), lease).await?;
            let expected = self.remote_checksum(remote, lease).await?;
            let actual = self.local_checksum(local).await?;
            if expected == actual {
                break;
            }
            if reattempted {
                let _ = tokio::fs::remove_file(local).await;
                return Err(TransferError::ChecksumMismatch {
                    path: remote.to_string(),
                    expected,
                    actual,
                }
                .into());
            }
            reattempted = true;
            warn!("Checksum mismatch for {} (expected {}, got {}); downloading again", remote, expected, actual);
        }
        info!("Downloaded {} in {:.1}s", remote, start.elapsed().as_secs_f64());
        Ok(StageResult::success(DOWNLOAD_STEP, start.elapsed(), vec![local.to_path_buf()]))
    }

    /// Copies one local artifact to the object store and verifies the stored
    /// checksum against the local file. A mismatch is uploaded once more.
    pub async fn upload(&self, local: &Path, remote: &RemotePath, lease: &CredentialLease) -> Result<StageResult, PipelineError> {
        let start = Instant::now();
        let expected = self.local_checksum(local).await?;
        let mut reattempted = false;
        loop {
            debug!("Uploading {} to {}", local.display(), remote);
            self.call_with_retries(&Op::Upload(local, remote), lease).await?;
            let actual = self.remote_checksum(remote, lease).await?;
            if expected == actual {
                break;
            }
            if reattempted {
                return Err(TransferError::ChecksumMismatch {
                    path: remote.to_string(),
                    expected,
                    actual,
                }
                .into());
            }
            reattempted = true;
            warn!("Checksum mismatch after uploading {} (expected {}, got {}); uploading again", remote, expected, actual);
        }
        info!("Uploaded {} in {:.1}s", remote, start.elapsed().as_secs_f64());
        Ok(StageResult::success(UPLOAD_STEP, start.elapsed(), vec![PathBuf::from(local)]))
    }
}
