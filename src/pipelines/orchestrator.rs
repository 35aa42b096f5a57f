// src/pipelines/orchestrator.rs: drives one PipelineRun through its stages

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use crate::config::defs::{
    PipelineError, RunConfig, ALIGNMENT_STAGE, CALLING_STAGE, INDEX_SUFFIXES, PREFLIGHT_STAGE, STAGING_STAGE,
    UPLOAD_STAGE,
};
use crate::config::profiles::ProfileSet;
use crate::pipelines::run::{PipelineRun, RunStatus, StageResult};
use crate::pipelines::stages::{AlignmentStage, CallingStage, Stage, StageInput};
use crate::utils::credentials::{CredentialLease, CredentialProvider};
use crate::utils::file::ScratchDir;
use crate::utils::storage::{ObjectStore, RemotePath};
use crate::utils::transfer::{TransferAdapter, TransferError};


/// Shared flag asking runs to stop at their next stage boundary. The tool
/// running at that moment is left to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}


/// Error of a run plus the stage it happened in.
type StageFailure = (&'static str, PipelineError);

fn at(stage: &'static str) -> impl Fn(PipelineError) -> StageFailure {
    move |e| (stage, e)
}


/// An input object and the companion index found for it during pre-flight.
#[derive(Debug, Clone)]
struct StagedInput {
    remote: RemotePath,
    index: Option<RemotePath>,
}


/// Pairs each call-set artifact with its destination. A single prefix
/// location receives every artifact under its own file name; otherwise
/// artifacts and locations are matched by position.
pub fn map_outputs(
    outputs: &[RemotePath],
    artifacts: &[PathBuf],
) -> Result<Vec<(PathBuf, RemotePath)>, PipelineError> {
    let file_name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::IOError(format!("Artifact {} has no file name", p.display())))
    };

    if let [prefix] = outputs {
        if prefix.is_prefix() {
            return artifacts
                .iter()
                .map(|a| -> Result<(PathBuf, RemotePath), PipelineError> { Ok((a.clone(), prefix.join(&file_name(a)?))) })
                .collect();
        }
    }
    if outputs.len() != artifacts.len() {
        return Err(PipelineError::InvalidConfig(format!(
            "{} output location(s) for {} call-set artifact(s)",
            outputs.len(),
            artifacts.len()
        )));
    }
    outputs
        .iter()
        .zip(artifacts)
        .map(|(remote, a)| -> Result<(PathBuf, RemotePath), PipelineError> {
            let remote = if remote.is_prefix() { remote.join(&file_name(a)?) } else { remote.clone() };
            Ok((a.clone(), remote))
        })
        .collect()
}


/// Runs pipelines: pre-flight, staging, alignment, calling, upload, cleanup.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    credentials: Arc<CredentialProvider>,
    transfer: TransferAdapter,
    alignment: Arc<dyn Stage>,
    calling: Arc<dyn Stage>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        credentials: Arc<CredentialProvider>,
        store: Arc<dyn ObjectStore>,
        profiles: Arc<ProfileSet>,
    ) -> Self {
        Self::with_stages(
            config,
            credentials,
            store,
            Arc::new(AlignmentStage::new(Arc::clone(&profiles))),
            Arc::new(CallingStage::new(profiles)),
        )
    }

    pub fn with_stages(
        config: Arc<RunConfig>,
        credentials: Arc<CredentialProvider>,
        store: Arc<dyn ObjectStore>,
        alignment: Arc<dyn Stage>,
        calling: Arc<dyn Stage>,
    ) -> Self {
        let transfer = TransferAdapter::new(store, config.retry);
        Self { config, credentials, transfer, alignment, calling }
    }

    pub async fn execute(&self, run: PipelineRun) -> PipelineRun {
        self.execute_with_cancel(run, &CancelToken::new()).await
    }

    /// Executes one run to a terminal status. Never returns an error: the
    /// outcome is the run's status and failure reason.
    ///
    /// # Arguments
    ///
    /// * `run` - A pending run.
    /// * `cancel` - Checked at every stage boundary.
    ///
    /// # Returns
    /// The run with status `complete` or `failed`, its history, stage
    /// results, and the remote paths uploaded.
    pub async fn execute_with_cancel(&self, mut run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        let start = Instant::now();
        info!("Starting {} pipeline for sample {}", run.variant, run.sample_id);

        if run.status != RunStatus::Pending {
            let e = PipelineError::InvalidConfig(format!("Run {} is {}, not pending", run.sample_id, run.status));
            run.fail(PREFLIGHT_STAGE, &e);
            return run;
        }

        match self.drive(&mut run, cancel).await {
            Ok(()) => {
                info!(
                    "Sample {} complete: {} artifact(s) uploaded in {:.1}s",
                    run.sample_id,
                    run.uploaded.len(),
                    start.elapsed().as_secs_f64()
                );
            }
            Err((stage, e)) => {
                error!("Sample {} failed in {}: {}", run.sample_id, stage, e);
                run.fail(stage, &e);
            }
        }
        run
    }

    async fn drive(&self, run: &mut PipelineRun, cancel: &CancelToken) -> Result<(), StageFailure> {
        checkpoint(cancel, PREFLIGHT_STAGE)?;
        run.validate().map_err(at(PREFLIGHT_STAGE))?;

        let scratch = ScratchDir::create(&run.scratch()).await.map_err(at(PREFLIGHT_STAGE))?;
        let outcome = self.drive_in(run, &scratch, cancel).await;
        scratch.remove().await;
        outcome?;

        run.advance(RunStatus::Complete).map_err(at(UPLOAD_STAGE))
    }

    async fn drive_in(&self, run: &mut PipelineRun, scratch: &ScratchDir, cancel: &CancelToken) -> Result<(), StageFailure> {
        let layout = scratch.layout().clone();
        let lease = self
            .credentials
            .lease(&run.scope(), Some(&layout.auth))
            .await
            .map_err(|e| (PREFLIGHT_STAGE, PipelineError::from(e)))?;

        let inputs = self.preflight(run, &lease).await.map_err(at(PREFLIGHT_STAGE))?;

        // Staging
        checkpoint(cancel, STAGING_STAGE)?;
        run.advance(RunStatus::Staging).map_err(at(STAGING_STAGE))?;
        let mut local_inputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let local = layout.input.join(input.remote.file_name().unwrap_or_default());
            let result = self.transfer.download(&input.remote, &local, &lease).await.map_err(at(STAGING_STAGE))?;
            run.stage_results.push(result);
            if let Some(index) = &input.index {
                let local_index = layout.input.join(index.file_name().unwrap_or_default());
                let result = self.transfer.download(index, &local_index, &lease).await.map_err(at(STAGING_STAGE))?;
                run.stage_results.push(result);
            }
            local_inputs.push(local);
        }

        // Alignment
        checkpoint(cancel, ALIGNMENT_STAGE)?;
        run.advance(RunStatus::Aligning).map_err(at(ALIGNMENT_STAGE))?;
        let aligned = self
            .run_stage(self.alignment.as_ref(), self.stage_input(run, local_inputs, layout.align.clone()))
            .await
            .map_err(at(ALIGNMENT_STAGE))?;
        run.stage_results.push(aligned.clone());

        // Calling
        checkpoint(cancel, CALLING_STAGE)?;
        run.advance(RunStatus::Calling).map_err(at(CALLING_STAGE))?;
        let called = self
            .run_stage(self.calling.as_ref(), self.stage_input(run, aligned.produced_artifacts, layout.call.clone()))
            .await
            .map_err(at(CALLING_STAGE))?;
        run.stage_results.push(called.clone());

        // Upload
        checkpoint(cancel, UPLOAD_STAGE)?;
        run.advance(RunStatus::Uploading).map_err(at(UPLOAD_STAGE))?;
        let destinations = map_outputs(&run.output_locations, &called.produced_artifacts).map_err(at(UPLOAD_STAGE))?;
        for (local, remote) in destinations {
            let result = self.transfer.upload(&local, &remote, &lease).await.map_err(at(UPLOAD_STAGE))?;
            run.stage_results.push(result);
            run.uploaded.push(remote);
        }

        lease.release();
        Ok(())
    }

    fn stage_input(&self, run: &PipelineRun, inputs: Vec<PathBuf>, stage_dir: PathBuf) -> StageInput {
        StageInput {
            sample_id: run.sample_id.clone(),
            variant: run.variant,
            inputs,
            stage_dir,
            resources: self.config.resources,
        }
    }

    /// Runs a stage, retrying once with doubled memory when the tool was
    /// killed for exhausting its resources.
    async fn run_stage(&self, stage: &dyn Stage, mut input: StageInput) -> Result<StageResult, PipelineError> {
        match stage.run(&input).await {
            Err(e) if self.config.is_resource_exhaustion(e.tool_exit_code()) => {
                let escalated = input.resources.escalated();
                warn!(
                    "{} for {} ran out of resources ({}); retrying once with {} MB instead of {} MB",
                    stage.name(),
                    input.sample_id,
                    e,
                    escalated.memory_mb,
                    input.resources.memory_mb
                );
                input.resources = escalated;
                stage.run(&input).await
            }
            other => other,
        }
    }

    /// Confirms every input exists, along with the index it needs.
    async fn preflight(&self, run: &PipelineRun, lease: &CredentialLease) -> Result<Vec<StagedInput>, PipelineError> {
        if !self.config.check_inputs_exist {
            debug!("Skipping input existence checks for {}", run.sample_id);
            return Ok(run
                .input_locations
                .iter()
                .map(|remote| StagedInput { remote: remote.clone(), index: None })
                .collect());
        }

        let mut staged = Vec::with_capacity(run.input_locations.len());
        for remote in &run.input_locations {
            if !self.transfer.exists(remote, lease).await? {
                return Err(TransferError::NotFound(remote.to_string()).into());
            }
            let index = self.find_index(remote, lease).await?;
            staged.push(StagedInput { remote: remote.clone(), index });
        }
        Ok(staged)
    }

    async fn find_index(&self, remote: &RemotePath, lease: &CredentialLease) -> Result<Option<RemotePath>, PipelineError> {
        let Some((ext, suffix)) = INDEX_SUFFIXES.iter().find(|(ext, _)| remote.key.ends_with(ext)) else {
            return Ok(None);
        };
        let mut candidates = vec![remote.with_suffix(suffix)];
        // VCF indexes only come as x.vcf.gz.tbi
        if *ext != ".vcf.gz" {
            candidates.extend(remote.replace_suffix(ext, suffix));
        }
        for candidate in &candidates {
            if self.transfer.exists(candidate, lease).await? {
                debug!("Found index {} for {}", candidate, remote);
                return Ok(Some(candidate.clone()));
            }
        }
        Err(TransferError::NotFound(format!("index for {} (tried {})", remote, candidates[0])).into())
    }

    /// Executes independent runs concurrently, at most `max_parallel` at a
    /// time. Results come back in input order.
    pub async fn execute_batch(&self, runs: Vec<PipelineRun>, max_parallel: usize) -> Vec<PipelineRun> {
        self.execute_batch_with_cancel(runs, max_parallel, &CancelToken::new()).await
    }

    pub async fn execute_batch_with_cancel(
        &self,
        runs: Vec<PipelineRun>,
        max_parallel: usize,
        cancel: &CancelToken,
    ) -> Vec<PipelineRun> {
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut seen = HashSet::new();
        info!("Executing {} run(s), {} at a time", runs.len(), max_parallel.max(1));

        let futures = runs.into_iter().map(|run| {
            // Two runs of one sample would share a scratch directory.
            let duplicate = !seen.insert((run.working_directory.clone(), run.sample_id.clone()));
            let semaphore = Arc::clone(&semaphore);
            async move {
                if duplicate {
                    let mut run = run;
                    let e = PipelineError::InvalidConfig(format!("Sample {} appears twice in the batch", run.sample_id));
                    run.fail(PREFLIGHT_STAGE, &e);
                    return run;
                }
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let mut run = run;
                        run.fail(PREFLIGHT_STAGE, &PipelineError::IOError(e.to_string()));
                        return run;
                    }
                };
                self.execute_with_cancel(run, cancel).await
            }
        });
        join_all(futures.collect::<Vec<_>>()).await
    }
}

fn checkpoint(cancel: &CancelToken, stage: &'static str) -> Result<(), StageFailure> {
    if cancel.is_cancelled() {
        warn!("Cancellation requested; stopping before {}", stage);
        return Err((stage, PipelineError::Cancelled));
    }
    Ok(())
}
