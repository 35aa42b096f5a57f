use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use lazy_static::lazy_static;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::utils::credentials::AuthError;
use crate::utils::system::ResourceAllocation;
use crate::utils::transfer::{RetryPolicy, TransferError};

// External software
pub const SAMTOOLS_TAG: &str = "samtools";
pub const SAMBLASTER_TAG: &str = "samblaster";
pub const SENTIEON_TAG: &str = "sentieon";
pub const GSUTIL_TAG: &str = "gsutil";
pub const GCLOUD_TAG: &str = "gcloud";


lazy_static! {
    /// Minimum (major, minor) versions of the external tools.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(SAMTOOLS_TAG, (1, 10));
        m.insert(SAMBLASTER_TAG, (0, 1));
        m.insert(GSUTIL_TAG, (4, 0));
        m
    };
}

// Stage names, as reported in StageResult and failure reasons
pub const PREFLIGHT_STAGE: &str = "preflight";
pub const STAGING_STAGE: &str = "staging";
pub const ALIGNMENT_STAGE: &str = "alignment";
pub const CALLING_STAGE: &str = "calling";
pub const UPLOAD_STAGE: &str = "uploading";
pub const DOWNLOAD_STEP: &str = "download";
pub const UPLOAD_STEP: &str = "upload";

// Scratch layout under <working_directory>/<sample_id>/
pub const INPUT_DIR: &str = "input";
pub const ALIGN_DIR: &str = "align";
pub const CALL_DIR: &str = "call";
pub const AUTH_DIR: &str = ".auth";
pub const ACCESS_TOKEN_FILE: &str = "access_token";

// Static Parameters
pub const DEFAULT_WORK_DIR: &str = "/mnt/work";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 30;
pub const STDERR_TAIL_LINES: usize = 20;

// 128 + SIGKILL: what the kernel OOM killer leaves behind
pub const DEFAULT_RESOURCE_EXHAUSTION_CODES: &[i32] = &[137];

/// Companion index that must sit next to an input object: `x.bam` needs
/// `x.bam.bai` or `x.bai`.
pub const INDEX_SUFFIXES: &[(&str, &str)] = &[
    (".bam", ".bai"),
    (".cram", ".crai"),
    (".vcf.gz", ".tbi"),
];


/// The analysis profiles supported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    Germline,
    Somatic,
    CcdgGermline,
}

impl PipelineVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineVariant::Germline => "germline",
            PipelineVariant::Somatic => "somatic",
            PipelineVariant::CcdgGermline => "ccdg_germline",
        }
    }
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the variant names plus the legacy DNA*/TN* pipeline names.
impl FromStr for PipelineVariant {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "germline" | "DNA" | "DNAseq" | "DNAscope" => Ok(PipelineVariant::Germline),
            "somatic" | "TN" | "TNseq" | "TNscope" => Ok(PipelineVariant::Somatic),
            "ccdg_germline" | "ccdg-germline" | "ccdg" => Ok(PipelineVariant::CcdgGermline),
            _ => Err(PipelineError::InvalidConfig(format!("Unsupported pipeline variant: {}", s))),
        }
    }
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("{tool} failed{}: {stderr_tail}", .exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    ToolExecution {
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IOError(String),
}

impl PipelineError {
    /// Exit code of the external tool, when the error came from one.
    pub fn tool_exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::ToolExecution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Everything a run needs that the shell drivers used to read from the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub work_root: PathBuf,
    pub project: Option<String>,
    pub credentials_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub resources: ResourceAllocation,
    pub resource_exhaustion_codes: Vec<i32>,
    pub check_inputs_exist: bool,
    pub max_parallel: usize,
    pub verbose: bool,
}

impl RunConfig {
    pub fn new(work_root: PathBuf) -> Self {
        Self {
            work_root,
            project: None,
            credentials_path: None,
            retry: RetryPolicy::default(),
            resources: ResourceAllocation::default(),
            resource_exhaustion_codes: DEFAULT_RESOURCE_EXHAUSTION_CODES.to_vec(),
            check_inputs_exist: true,
            max_parallel: 2,
            verbose: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.retry.base_delay = base_delay;
        self
    }

    pub fn is_resource_exhaustion(&self, exit_code: Option<i32>) -> bool {
        exit_code.is_some_and(|c| self.resource_exhaustion_codes.contains(&c))
    }
}
