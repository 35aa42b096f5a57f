use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{self, LevelFilter, debug, error, info, warn};
use env_logger::Builder;
use sentieon_pipelines::cli::{parse, Arguments};
use sentieon_pipelines::config::defs::{PipelineError, RunConfig, GSUTIL_TAG, PREFLIGHT_STAGE};
use sentieon_pipelines::config::profiles::ProfileSet;
use sentieon_pipelines::pipelines::gen_credentials;
use sentieon_pipelines::pipelines::orchestrator::{CancelToken, Orchestrator};
use sentieon_pipelines::pipelines::run::{batch_scheme, load_batch, PipelineRun, RunStatus};
use sentieon_pipelines::utils::command::check_versions;
use sentieon_pipelines::utils::credentials::{CommandIssuer, CredentialIssuer, CredentialProvider, EphemeralIssuer, Permission, Scope};
use sentieon_pipelines::utils::storage::{GsutilStore, LocalStore, ObjectStore, RemotePath, Scheme};
use sentieon_pipelines::utils::system::ResourceAllocation;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Sentieon Pipelines\n-------------\n");

    let resources = ResourceAllocation::detect(args.threads)?;
    debug!(
        "Using {} threads and {} MB per tool (retry cap {} MB)",
        resources.threads, resources.memory_mb, resources.memory_cap_mb
    );

    let mut config = RunConfig::new(args.work_dir.clone()).with_max_retries(args.max_retries);
    config.project = args.project.clone();
    config.credentials_path = args.credentials.clone();
    config.resources = resources;
    config.resource_exhaustion_codes = args.resource_exhaustion_codes.clone();
    config.check_inputs_exist = !args.no_check_inputs_exist;
    config.max_parallel = args.max_parallel.max(1);
    config.verbose = args.verbose;
    let run_config = Arc::new(config);

    let module = args.module.clone();
    let outcome = match module.as_str() {
        "gen_credentials" | "gen-credentials" => gen_credentials_run(&args, run_config).await.map(|_| Vec::new()),
        _ => pipeline_run(&args, run_config).await,
    };

    let runs = match outcome {
        Ok(runs) => runs,
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            eprintln!("failed stage: {}: {}", PREFLIGHT_STAGE, e);
            std::process::exit(1);
        }
    };

    let mut failed = false;
    for run in &runs {
        if let Some(failure) = &run.failure {
            failed = true;
            error!("Sample {} failed: {}", run.sample_id, failure);
            eprintln!("failed stage: {}: {}", failure.stage, failure.error);
        } else if run.status == RunStatus::Complete {
            for remote in &run.uploaded {
                info!("{}: {}", run.sample_id, remote);
            }
        }
    }
    if failed {
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Object store and credential issuer matching the locations' scheme.
fn backend(scheme: Scheme, args: &Arguments, run_config: &RunConfig) -> (Arc<dyn ObjectStore>, Arc<dyn CredentialIssuer>) {
    let lifetime = chrono::Duration::seconds(args.token_lifetime_secs);
    let grantable = &args.grantable_buckets;
    match scheme {
        Scheme::File => {
            let issuer = EphemeralIssuer::new(lifetime);
            let issuer = if grantable.is_empty() { issuer } else { issuer.with_grantable(grantable.iter().cloned()) };
            (Arc::new(LocalStore), Arc::new(issuer))
        }
        Scheme::Gs => {
            let store = GsutilStore {
                project: run_config.project.clone(),
                ..GsutilStore::default()
            };
            let issuer = CommandIssuer {
                lifetime,
                credentials_path: run_config.credentials_path.clone(),
                grantable: (!grantable.is_empty()).then(|| grantable.iter().cloned().collect()),
                ..CommandIssuer::default()
            };
            (Arc::new(store), Arc::new(issuer))
        }
    }
}


async fn pipeline_run(args: &Arguments, run_config: Arc<RunConfig>) -> Result<Vec<PipelineRun>, PipelineError> {
    let profiles_path = args
        .profiles
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("--profiles is required".to_string()))?;
    let profiles = Arc::new(ProfileSet::load(profiles_path)?);

    let runs = match &args.batch {
        Some(batch) => load_batch(batch, &args.module, &run_config.work_root)?,
        None => {
            let sample_id = args
                .sample_id
                .as_deref()
                .ok_or_else(|| PipelineError::InvalidConfig("--sample-id is required".to_string()))?;
            vec![PipelineRun::parse(sample_id, &args.module, &args.inputs, &args.outputs, &run_config.work_root)?]
        }
    };
    let scheme = batch_scheme(&runs)?;

    if args.no_check_versions {
        debug!("Skipping tool version checks");
    } else {
        let mut programs = profiles.programs();
        if scheme == Scheme::Gs {
            programs.push(GSUTIL_TAG.to_string());
        }
        for (tool, version) in check_versions(&programs)
            .await
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?
        {
            info!("{} version: {}", tool, version);
        }
    }

    let (store, issuer) = backend(scheme, args, &run_config);
    let credentials = Arc::new(CredentialProvider::new(issuer));
    let orchestrator = Orchestrator::new(Arc::clone(&run_config), credentials, store, profiles);

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the running tool finishes");
            on_signal.cancel();
        }
    });

    let finished = if runs.len() == 1 {
        let mut runs = runs;
        match runs.pop() {
            Some(run) => vec![orchestrator.execute_with_cancel(run, &cancel).await],
            None => Vec::new(),
        }
    } else {
        orchestrator
            .execute_batch_with_cancel(runs, run_config.max_parallel, &cancel)
            .await
    };
    Ok(finished)
}


async fn gen_credentials_run(args: &Arguments, run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let key_out = args
        .key_out
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("--key-out is required for gen_credentials".to_string()))?;

    let parse = |locations: &[String]| -> Result<Vec<RemotePath>, PipelineError> {
        locations
            .iter()
            .flat_map(|s| s.split(','))
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect()
    };
    let inputs = parse(&args.inputs)?;
    let outputs = parse(&args.outputs)?;

    let mut permissions = Vec::new();
    if !inputs.is_empty() {
        permissions.push(Permission::Read);
    }
    if !outputs.is_empty() {
        permissions.push(Permission::Write);
    }
    let scope = Scope::new(inputs.iter().chain(outputs.iter()).map(|p| p.bucket.clone()), &permissions);
    let scheme = inputs
        .iter()
        .chain(outputs.iter())
        .map(|p| p.scheme)
        .next()
        .unwrap_or(Scheme::Gs);

    let (_, issuer) = backend(scheme, args, &run_config);
    let provider = Arc::new(CredentialProvider::new(issuer));
    let credential = gen_credentials::run(provider, &scope, Path::new(key_out)).await?;
    println!("Access token written to {} (expires {})", key_out.display(), credential.expires_at);
    Ok(())
}
