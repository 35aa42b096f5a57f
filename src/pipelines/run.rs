use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::config::defs::{PipelineError, PipelineVariant, ALIGN_DIR, AUTH_DIR, CALL_DIR, INPUT_DIR};
use crate::utils::credentials::{Permission, Scope};
use crate::utils::storage::{RemotePath, Scheme};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Pending,
    Staging,
    Aligning,
    Calling,
    Uploading,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed)
    }

    /// The only forward edge out of each non-terminal state.
    pub fn next(&self) -> Option<RunStatus> {
        match self {
            RunStatus::Pending => Some(RunStatus::Staging),
            RunStatus::Staging => Some(RunStatus::Aligning),
            RunStatus::Aligning => Some(RunStatus::Calling),
            RunStatus::Calling => Some(RunStatus::Uploading),
            RunStatus::Uploading => Some(RunStatus::Complete),
            RunStatus::Complete | RunStatus::Failed => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Staging => "staging",
            RunStatus::Aligning => "aligning",
            RunStatus::Calling => "calling",
            RunStatus::Uploading => "uploading",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}


/// Outcome of one stage or transfer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage_name: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub produced_artifacts: Vec<PathBuf>,
}

impl StageResult {
    pub fn success(stage_name: &str, duration: Duration, produced_artifacts: Vec<PathBuf>) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            exit_code: 0,
            duration,
            produced_artifacts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}


/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReason {
    pub stage: String,
    pub error: String,
    pub cancelled: bool,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}


/// Directories of one run: `<working_directory>/<sample_id>/{input,align,call}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchLayout {
    pub root: PathBuf,
    pub input: PathBuf,
    pub align: PathBuf,
    pub call: PathBuf,
    pub auth: PathBuf,
}

impl ScratchLayout {
    pub fn new(working_directory: &Path, sample_id: &str) -> Self {
        let root = working_directory.join(sample_id);
        Self {
            input: root.join(INPUT_DIR),
            align: root.join(ALIGN_DIR),
            call: root.join(CALL_DIR),
            auth: root.join(AUTH_DIR),
            root,
        }
    }
}


/// One execution of the pipeline for one sample.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub sample_id: String,
    pub variant: PipelineVariant,
    pub input_locations: Vec<RemotePath>,
    pub output_locations: Vec<RemotePath>,
    pub working_directory: PathBuf,
    pub status: RunStatus,
    /// Every status entered, in order, starting with `pending`.
    pub history: Vec<RunStatus>,
    pub stage_results: Vec<StageResult>,
    pub failure: Option<FailureReason>,
    pub uploaded: Vec<RemotePath>,
}

impl PipelineRun {
    pub fn new(
        sample_id: impl Into<String>,
        variant: PipelineVariant,
        input_locations: Vec<RemotePath>,
        output_locations: Vec<RemotePath>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sample_id: sample_id.into(),
            variant,
            input_locations,
            output_locations,
            working_directory: working_directory.into(),
            status: RunStatus::Pending,
            history: vec![RunStatus::Pending],
            stage_results: Vec::new(),
            failure: None,
            uploaded: Vec::new(),
        }
    }

    /// Builds a run from the string form used on the command line and in batch files.
    pub fn parse(
        sample_id: &str,
        variant: &str,
        inputs: &[String],
        outputs: &[String],
        working_directory: &Path,
    ) -> Result<Self, PipelineError> {
        let variant = variant.parse::<PipelineVariant>()?;
        let inputs = inputs
            .iter()
            .flat_map(|s| s.split(','))
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<RemotePath>, _>>()?;
        let outputs = outputs
            .iter()
            .flat_map(|s| s.split(','))
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<RemotePath>, _>>()?;
        Ok(Self::new(sample_id, variant, inputs, outputs, working_directory))
    }

    pub fn scratch(&self) -> ScratchLayout {
        ScratchLayout::new(&self.working_directory, &self.sample_id)
    }

    /// Moves to `next`, which must be the successor of the current status.
    pub fn advance(&mut self, next: RunStatus) -> Result<(), PipelineError> {
        if self.status.next() != Some(next) {
            return Err(PipelineError::InvalidConfig(format!(
                "Illegal status transition {} -> {} for {}",
                self.status, next, self.sample_id
            )));
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to `failed` from any non-terminal status.
    pub fn fail(&mut self, stage: &str, error: &PipelineError) {
        if self.status.is_terminal() {
            return;
        }
        self.status = RunStatus::Failed;
        self.history.push(RunStatus::Failed);
        self.failure = Some(FailureReason {
            stage: stage.to_string(),
            error: error.to_string(),
            cancelled: matches!(error, PipelineError::Cancelled),
        });
    }

    /// Buckets read for inputs and written for outputs.
    pub fn scope(&self) -> Scope {
        let mut buckets: Vec<String> = self
            .input_locations
            .iter()
            .chain(self.output_locations.iter())
            .map(|p| p.bucket.clone())
            .collect();
        buckets.sort();
        buckets.dedup();
        let mut permissions = Vec::new();
        if !self.input_locations.is_empty() {
            permissions.push(Permission::Read);
        }
        if !self.output_locations.is_empty() {
            permissions.push(Permission::Write);
        }
        Scope::new(buckets, &permissions)
    }

    /// Checks everything that can be checked before touching the network.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_id.is_empty()
            || self.sample_id.starts_with('.')
            || !self.sample_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Invalid sample id '{}': use letters, digits, '.', '_' or '-'",
                self.sample_id
            )));
        }
        if self.input_locations.is_empty() {
            return Err(PipelineError::InvalidConfig(format!("No input locations for {}", self.sample_id)));
        }
        if self.output_locations.is_empty() {
            return Err(PipelineError::InvalidConfig(format!("No output locations for {}", self.sample_id)));
        }
        if let Some(prefix) = self.input_locations.iter().find(|p| p.is_prefix()) {
            return Err(PipelineError::InvalidConfig(format!("Input {} names a prefix, not an object", prefix)));
        }

        let mut names = HashSet::new();
        for input in &self.input_locations {
            let name = input.file_name().unwrap_or_default();
            if !names.insert(name) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Inputs share the file name '{}'; they would overwrite each other in scratch",
                    name
                )));
            }
        }

        let scheme = self.input_locations[0].scheme;
        if let Some(other) = self
            .input_locations
            .iter()
            .chain(self.output_locations.iter())
            .find(|p| p.scheme != scheme)
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Mixed storage schemes: {} is not {}://",
                other,
                scheme.as_str()
            )));
        }
        Ok(())
    }
}


/// One sample of a `--batch` file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEntry {
    pub sample_id: String,
    /// Falls back to the `--module` variant.
    #[serde(default)]
    pub variant: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl BatchEntry {
    pub fn into_run(self, default_variant: &str, working_directory: &Path) -> Result<PipelineRun, PipelineError> {
        let variant = self.variant.as_deref().unwrap_or(default_variant);
        PipelineRun::parse(&self.sample_id, variant, &self.inputs, &self.outputs, working_directory)
    }
}

/// Reads a `--batch` file: a JSON list of samples.
pub fn load_batch(path: &Path, default_variant: &str, working_directory: &Path) -> Result<Vec<PipelineRun>, PipelineError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot read batch file {}: {}", path.display(), e)))?;
    let entries: Vec<BatchEntry> = serde_json::from_str(&text)
        .map_err(|e| PipelineError::InvalidConfig(format!("Invalid batch file {}: {}", path.display(), e)))?;
    entries
        .into_iter()
        .map(|entry| entry.into_run(default_variant, working_directory))
        .collect()
}


/// The one storage scheme shared by every location of every run. One store
/// serves a whole batch, so mixing `gs://` and `file://` is refused up front.
pub fn batch_scheme(runs: &[PipelineRun]) -> Result<Scheme, PipelineError> {
    let mut locations = runs
        .iter()
        .flat_map(|r| r.input_locations.iter().chain(r.output_locations.iter()));
    let first = locations
        .next()
        .ok_or_else(|| PipelineError::InvalidConfig("No input or output locations".to_string()))?;
    match locations.find(|p| p.scheme != first.scheme) {
        Some(other) => Err(PipelineError::InvalidConfig(format!(
            "Mixed storage schemes in batch: {} is not {}://",
            other,
            first.scheme.as_str()
        ))),
        None => Ok(first.scheme),
    }
}
