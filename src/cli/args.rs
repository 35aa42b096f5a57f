use std::path::PathBuf;
use clap::Parser;
use crate::config::defs::{DEFAULT_MAX_RETRIES, DEFAULT_TOKEN_LIFETIME_SECS, DEFAULT_WORK_DIR};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "sentieon-pipelines", version, about = "Germline and somatic variant-calling pipelines over cloud storage")]
pub struct Arguments {

    #[arg(short, long, help = "germline, somatic, ccdg_germline or gen_credentials")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 's', long = "sample-id")]
    pub sample_id: Option<String>,

    #[arg(short = 'i', long = "input", help = "Input object (gs:// or file://); repeatable or comma-separated")]
    pub inputs: Vec<String>,

    #[arg(short = 'o', long = "output", help = "Output object or prefix ending in '/'; repeatable")]
    pub outputs: Vec<String>,

    #[arg(long, help = "JSON file with the invocation profile of each variant")]
    pub profiles: Option<PathBuf>,

    #[arg(long, help = "JSON list of samples to run concurrently instead of -s/-i/-o")]
    pub batch: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    pub max_parallel: usize,

    #[arg(long, default_value_t = false)]
    pub no_check_inputs_exist: bool,

    #[arg(long, default_value_t = false, help = "Skip the minimum-version check of the external tools")]
    pub no_check_versions: bool,

    #[arg(long, help = "Where gen_credentials writes the access token")]
    pub key_out: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long, env = "PIPELINE_WORK_DIR", default_value = DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    #[arg(long, env = "PIPELINE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    pub project: Option<String>,

    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_TOKEN_LIFETIME_SECS)]
    pub token_lifetime_secs: i64,

    #[clap(
        long,
        value_delimiter = ',',
        default_value = "137",
        help = "Comma-separated tool exit codes that mean the tool ran out of memory"
    )]
    pub resource_exhaustion_codes: Vec<i32>,

    #[arg(
        long,
        env = "PIPELINE_GRANTABLE_BUCKETS",
        value_delimiter = ',',
        help = "Buckets credentials may be issued for; any bucket when unset"
    )]
    pub grantable_buckets: Vec<String>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline_arguments() {
        let args = Arguments::try_parse_from([
            "sentieon-pipelines",
            "-m", "germline",
            "-s", "S1",
            "-i", "gs://in/S1.bam",
            "-i", "gs://in/S1b.bam",
            "-o", "gs://out/S1/",
            "--work-dir", "/scratch",
            "--max-retries", "5",
            "--no-check-inputs-exist",
        ])
        .unwrap();
        assert_eq!(args.module, "germline");
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.work_dir, PathBuf::from("/scratch"));
        assert_eq!(args.max_retries, 5);
        assert!(args.no_check_inputs_exist);
        assert_eq!(args.resource_exhaustion_codes, vec![137]);
    }

    #[test]
    fn test_parse_grantable_buckets() {
        let args = Arguments::try_parse_from([
            "sentieon-pipelines",
            "-m", "gen_credentials",
            "--grantable-buckets", "in-bucket,out-bucket",
        ])
        .unwrap();
        assert_eq!(args.grantable_buckets, vec!["in-bucket", "out-bucket"]);
    }

    #[test]
    fn test_module_required() {
        assert!(Arguments::try_parse_from(["sentieon-pipelines", "-s", "S1"]).is_err());
    }
}
