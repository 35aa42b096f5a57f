#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use sentieon_pipelines::config::defs::{PipelineError, RunConfig};
use sentieon_pipelines::pipelines::orchestrator::{CancelToken, Orchestrator};
use sentieon_pipelines::pipelines::run::StageResult;
use sentieon_pipelines::pipelines::stages::{Stage, StageInput};
use sentieon_pipelines::utils::credentials::{CredentialLease, CredentialProvider, EphemeralIssuer, Permission, Scope};
use sentieon_pipelines::utils::storage::{blake3_file, ObjectStore, RemotePath, StoreError};


/// Failures the mock store hands out before behaving.
#[derive(Debug, Default)]
pub struct Faults {
    pub transient: usize,
    pub unauthorized: usize,
    pub corrupt_downloads: usize,
    pub corrupt_uploads: usize,
}

/// In-memory object store with call counters and scripted faults.
#[derive(Default)]
pub struct MockStore {
    pub objects: Mutex<HashMap<RemotePath, Vec<u8>>>,
    pub faults: Mutex<Faults>,
    pub downloads: AtomicUsize,
    pub uploads: AtomicUsize,
    pub stats: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        let remote: RemotePath = path.parse().unwrap();
        self.objects.lock().unwrap().insert(remote, data.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let remote: RemotePath = path.parse().unwrap();
        self.objects.lock().unwrap().get(&remote).cloned()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock().unwrap() = faults;
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn injected(&self) -> Option<StoreError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.transient > 0 {
            faults.transient -= 1;
            return Some(StoreError::Transient("503 Service Unavailable".to_string()));
        }
        if faults.unauthorized > 0 {
            faults.unauthorized -= 1;
            return Some(StoreError::Unauthorized("401 Invalid Credentials".to_string()));
        }
        None
    }

    fn take(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

fn corrupt(mut data: Vec<u8>) -> Vec<u8> {
    data.push(0xff);
    data
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn download(&self, remote: &RemotePath, local: &Path, _lease: &CredentialLease) -> Result<(), StoreError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.injected() {
            return Err(e);
        }
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(remote.to_string()))?;
        let data = if Self::take(&mut self.faults.lock().unwrap().corrupt_downloads) { corrupt(data) } else { data };
        std::fs::write(local, data).map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn upload(&self, local: &Path, remote: &RemotePath, _lease: &CredentialLease) -> Result<(), StoreError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.injected() {
            return Err(e);
        }
        let data = std::fs::read(local).map_err(|e| StoreError::Io(e.to_string()))?;
        let data = if Self::take(&mut self.faults.lock().unwrap().corrupt_uploads) { corrupt(data) } else { data };
        self.objects.lock().unwrap().insert(remote.clone(), data);
        Ok(())
    }

    async fn exists(&self, remote: &RemotePath, _lease: &CredentialLease) -> Result<bool, StoreError> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().unwrap().contains_key(remote))
    }

    async fn remote_checksum(&self, remote: &RemotePath, _lease: &CredentialLease) -> Result<String, StoreError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(remote.to_string()))?;
        Ok(blake3::hash(&data).to_hex().to_string())
    }

    async fn local_checksum(&self, local: &Path) -> Result<String, StoreError> {
        blake3_file(local).await
    }
}


/// What a MockStage invocation saw.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub sample_id: String,
    pub inputs: Vec<PathBuf>,
    pub stage_dir: PathBuf,
    pub memory_mb: u64,
}

/// Stage that writes `<sample_id>.<suffix>` artifacts, or fails with the
/// scripted exit codes first.
pub struct MockStage {
    pub name: &'static str,
    pub suffixes: Vec<&'static str>,
    pub exit_codes: Mutex<Vec<i32>>,
    pub calls: Mutex<Vec<StageCall>>,
    pub cancel_on_run: Option<CancelToken>,
    pub delay: Duration,
}

impl MockStage {
    pub fn new(name: &'static str, suffixes: &[&'static str]) -> Self {
        Self {
            name,
            suffixes: suffixes.to_vec(),
            exit_codes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            cancel_on_run: None,
            delay: Duration::ZERO,
        }
    }

    /// Exit codes returned by the first invocations, in order.
    pub fn failing_with(self, codes: &[i32]) -> Self {
        *self.exit_codes.lock().unwrap() = codes.to_vec();
        self
    }

    pub fn cancelling(mut self, token: CancelToken) -> Self {
        self.cancel_on_run = Some(token);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, input: &StageInput) -> Result<StageResult, PipelineError> {
        self.calls.lock().unwrap().push(StageCall {
            sample_id: input.sample_id.clone(),
            inputs: input.inputs.clone(),
            stage_dir: input.stage_dir.clone(),
            memory_mb: input.resources.memory_mb,
        });
        if let Some(token) = &self.cancel_on_run {
            token.cancel();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let code = {
            let mut codes = self.exit_codes.lock().unwrap();
            if codes.is_empty() { 0 } else { codes.remove(0) }
        };
        if code != 0 {
            return Err(PipelineError::ToolExecution {
                tool: self.name.to_string(),
                exit_code: Some(code),
                stderr_tail: "simulated failure".to_string(),
            });
        }

        for input_path in &input.inputs {
            assert!(input_path.exists(), "{} missing", input_path.display());
        }
        tokio::fs::create_dir_all(&input.stage_dir).await?;
        let mut artifacts = Vec::new();
        for suffix in &self.suffixes {
            let path = input.stage_dir.join(format!("{}.{}", input.sample_id, suffix));
            tokio::fs::write(&path, format!("{} {} {}", self.name, input.sample_id, suffix)).await?;
            artifacts.push(path);
        }
        Ok(StageResult::success(self.name, Duration::from_millis(1), artifacts))
    }
}


pub fn config(work_root: &Path) -> RunConfig {
    RunConfig::new(work_root.to_path_buf()).with_backoff(Duration::from_millis(10))
}

pub fn provider() -> Arc<CredentialProvider> {
    Arc::new(CredentialProvider::new(Arc::new(EphemeralIssuer::default())))
}

pub fn scope() -> Scope {
    Scope::new(["in", "out"], &[Permission::Read, Permission::Write])
}

pub fn orchestrator(
    config: RunConfig,
    store: Arc<MockStore>,
    alignment: Arc<MockStage>,
    calling: Arc<MockStage>,
) -> Orchestrator {
    Orchestrator::with_stages(Arc::new(config), provider(), store, alignment, calling)
}

/// Names of everything left under `dir`, recursively.
pub fn leftovers(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(leftovers(&path));
            }
            found.push(path);
        }
    }
    found
}
