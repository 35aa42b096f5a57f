// src/pipelines/stages.rs: the two external-tool stages of a run

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use async_trait::async_trait;
use log::{debug, info};
use crate::config::defs::{PipelineError, PipelineVariant, ALIGNMENT_STAGE, CALLING_STAGE};
use crate::config::profiles::{ProfileSet, StageProfile, VariantProfile};
use crate::pipelines::run::StageResult;
use crate::utils::command::{run_chain, CommandSpec, TemplateVars};
use crate::utils::file::list_files;
use crate::utils::system::ResourceAllocation;


/// Everything a stage is given for one invocation.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub sample_id: String,
    pub variant: PipelineVariant,
    /// Local files, in order.
    pub inputs: Vec<PathBuf>,
    /// Directory receiving the stage's artifacts; also the tools' cwd.
    pub stage_dir: PathBuf,
    pub resources: ResourceAllocation,
}


/// A step of the pipeline that turns local files into local artifacts.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the stage once. No retries here; the orchestrator decides.
    async fn run(&self, input: &StageInput) -> Result<StageResult, PipelineError>;
}


/// Placeholder values shared by every command of a stage invocation.
fn template_vars(input: &StageInput, profile: &VariantProfile) -> TemplateVars {
    let mut vars = TemplateVars::new();
    for (key, value) in &profile.resources {
        vars.set(key, value.as_str());
    }
    vars.set("sample_id", input.sample_id.as_str())
        .set("variant", input.variant.as_str())
        .set_path("stage_dir", &input.stage_dir)
        .set("threads", input.resources.threads.to_string())
        .set("memory_mb", input.resources.memory_mb.to_string())
        .set_list(
            "inputs",
            input.inputs.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
        );
    if let Some(first) = input.inputs.first() {
        vars.set_path("input", first);
    }
    vars
}


/// Runs the tool chain of one stage profile.
///
/// # Arguments
///
/// * `name` - Stage name reported in the StageResult.
/// * `stage` - Commands and declared artifacts.
/// * `vars` - Placeholder values; `{output}` is added here.
/// * `stage_dir` - Working directory of the chain.
///
/// # Returns
/// StageResult listing the declared artifacts, or ToolExecution when a tool
/// fails or an artifact is missing afterwards.
async fn run_profile(
    name: &str,
    stage: &StageProfile,
    mut vars: TemplateVars,
    stage_dir: &Path,
) -> Result<StageResult, PipelineError> {
    let start = Instant::now();
    tokio::fs::create_dir_all(stage_dir).await?;

    let artifacts: Vec<PathBuf> = stage
        .expand_artifacts(&vars)?
        .into_iter()
        .map(|a| stage_dir.join(a))
        .collect();
    if let Some(first) = artifacts.first() {
        vars.set_path("output", first);
    }

    let commands = stage
        .commands
        .iter()
        .map(|t| t.render(&vars))
        .collect::<Result<Vec<CommandSpec>, _>>()?;
    let stdout_to = match &stage.stdout_artifact {
        Some(_) => artifacts.first().map(PathBuf::as_path),
        None => None,
    };

    let chain = run_chain(&commands, stage_dir, stdout_to).await?;
    for tool in &chain.tools {
        debug!("{} exited {}", tool.tool, tool.exit_code);
    }

    let last_tool = commands.last().map(|c| c.program.clone()).unwrap_or_default();
    for artifact in &artifacts {
        if !tokio::fs::try_exists(artifact).await? {
            return Err(PipelineError::ToolExecution {
                tool: last_tool,
                exit_code: Some(0),
                stderr_tail: format!(
                    "declared artifact {} was not produced (found: {})",
                    artifact.display(),
                    list_files(stage_dir).join(", ")
                ),
            });
        }
    }

    info!("{} finished in {:.1}s with {} artifact(s)", name, start.elapsed().as_secs_f64(), artifacts.len());
    Ok(StageResult::success(name, start.elapsed(), artifacts))
}


/// Alignment post-processing: one sorted, duplicate-marked alignment per sample.
#[derive(Debug, Clone)]
pub struct AlignmentStage {
    profiles: Arc<ProfileSet>,
}

impl AlignmentStage {
    pub fn new(profiles: Arc<ProfileSet>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl Stage for AlignmentStage {
    fn name(&self) -> &str {
        ALIGNMENT_STAGE
    }

    async fn run(&self, input: &StageInput) -> Result<StageResult, PipelineError> {
        let profile = self.profiles.get(input.variant)?;
        if input.inputs.is_empty() {
            return Err(PipelineError::InvalidConfig("Alignment needs at least one input".to_string()));
        }
        info!("Aligning {} ({} input(s))", input.sample_id, input.inputs.len());
        let vars = template_vars(input, profile);
        run_profile(ALIGNMENT_STAGE, &profile.alignment, vars, &input.stage_dir).await
    }
}


/// Variant calling on the alignment artifact, under the variant's profile.
#[derive(Debug, Clone)]
pub struct CallingStage {
    profiles: Arc<ProfileSet>,
}

impl CallingStage {
    pub fn new(profiles: Arc<ProfileSet>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl Stage for CallingStage {
    fn name(&self) -> &str {
        CALLING_STAGE
    }

    async fn run(&self, input: &StageInput) -> Result<StageResult, PipelineError> {
        let profile = self.profiles.get(input.variant)?;
        let alignment = input
            .inputs
            .first()
            .ok_or_else(|| PipelineError::InvalidConfig("Calling needs an alignment artifact".to_string()))?;
        info!("Calling {} variants for {} from {}", input.variant, input.sample_id, alignment.display());
        let vars = template_vars(input, profile);
        run_profile(CALLING_STAGE, &profile.calling, vars, &input.stage_dir).await
    }
}
