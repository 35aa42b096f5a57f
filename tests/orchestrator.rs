mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use common::{config, leftovers, orchestrator, Faults, MockStage, MockStore};
use sentieon_pipelines::config::defs::{PipelineVariant, ALIGNMENT_STAGE, CALLING_STAGE, PREFLIGHT_STAGE, STAGING_STAGE, UPLOAD_STAGE};
use sentieon_pipelines::config::profiles::ProfileSet;
use sentieon_pipelines::pipelines::orchestrator::{CancelToken, Orchestrator};
use sentieon_pipelines::pipelines::run::{PipelineRun, RunStatus};
use sentieon_pipelines::utils::credentials::{CredentialProvider, EphemeralIssuer};
use sentieon_pipelines::utils::storage::LocalStore;
use tempfile::TempDir;


fn run(sample_id: &str, work: &Path) -> PipelineRun {
    PipelineRun::new(
        sample_id,
        PipelineVariant::Germline,
        vec![format!("gs://in/{}_R1.fastq.gz", sample_id).parse().unwrap()],
        vec!["gs://out/results/".parse().unwrap()],
        work,
    )
}

fn stages() -> (Arc<MockStage>, Arc<MockStage>) {
    (
        Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"])),
        Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz", "vcf.gz.tbi"])),
    )
}

fn store_with_inputs(samples: &[&str]) -> Arc<MockStore> {
    let store = MockStore::new();
    for sample in samples {
        store.put(&format!("gs://in/{}_R1.fastq.gz", sample), format!("reads of {}", sample).as_bytes());
    }
    store
}


#[tokio::test]
async fn test_status_sequence_on_success() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Complete);
    assert_eq!(
        finished.history,
        vec![
            RunStatus::Pending,
            RunStatus::Staging,
            RunStatus::Aligning,
            RunStatus::Calling,
            RunStatus::Uploading,
            RunStatus::Complete,
        ]
    );
    assert!(finished.failure.is_none());
    let uploaded: Vec<String> = finished.uploaded.iter().map(|p| p.to_string()).collect();
    assert_eq!(uploaded, vec!["gs://out/results/S1.vcf.gz", "gs://out/results/S1.vcf.gz.tbi"]);
    assert_eq!(store.get("gs://out/results/S1.vcf.gz"), Some(b"calling S1 vcf.gz".to_vec()));

    // Calling consumed exactly the alignment artifact.
    let call = &calling.calls()[0];
    assert_eq!(call.inputs, vec![work.path().join("S1").join("align").join("S1.bam")]);
    assert!(finished.stage_results.iter().all(|r| r.is_success()));

    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_aligner_failure_stops_run() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let alignment = Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"]).failing_with(&[1]));
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(alignment.calls().len(), 1);
    assert!(calling.calls().is_empty());
    assert_eq!(store.uploads(), 0);
    assert!(finished.uploaded.is_empty());
    let failure = finished.failure.expect("failure reason");
    assert_eq!(failure.stage, ALIGNMENT_STAGE);
    assert!(failure.error.contains("exit code 1"));
    assert_eq!(finished.history.last(), Some(&RunStatus::Failed));
    assert!(!finished.history.contains(&RunStatus::Calling));
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_resource_exhaustion_retried_once_with_more_memory() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let alignment = Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"]).failing_with(&[137]));
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Complete);
    let calls = alignment.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].memory_mb, 2048);
    assert_eq!(calls[1].memory_mb, 4096);
    assert_eq!(calling.calls()[0].memory_mb, 2048);
    Ok(())
}


#[tokio::test]
async fn test_resource_exhaustion_retried_only_once() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, _) = stages();
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]).failing_with(&[137, 137]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling.clone());

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(calling.calls().len(), 2);
    assert_eq!(finished.failure.unwrap().stage, CALLING_STAGE);
    assert_eq!(store.uploads(), 0);
    Ok(())
}


#[tokio::test]
async fn test_missing_input_fails_preflight() -> Result<()> {
    let work = TempDir::new()?;
    let store = MockStore::new();
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling);

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.history, vec![RunStatus::Pending, RunStatus::Failed]);
    assert_eq!(finished.failure.unwrap().stage, PREFLIGHT_STAGE);
    assert_eq!(store.downloads(), 0);
    assert!(alignment.calls().is_empty());
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_companion_index_required_and_staged() -> Result<()> {
    let work = TempDir::new()?;
    let store = MockStore::new();
    store.put("gs://in/S1.bam", b"bam");
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling);
    let bam_run = |work: &Path| {
        PipelineRun::new(
            "S1",
            PipelineVariant::Somatic,
            vec!["gs://in/S1.bam".parse().unwrap()],
            vec!["gs://out/".parse().unwrap()],
            work,
        )
    };

    let finished = orchestrator.execute(bam_run(work.path())).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished.failure.unwrap().error.contains("index"));

    store.put("gs://in/S1.bai", b"index");
    let finished = orchestrator.execute(bam_run(work.path())).await;
    assert_eq!(finished.status, RunStatus::Complete);
    assert_eq!(store.downloads(), 2);
    // Only the alignment itself is a stage input; the index sits beside it.
    assert_eq!(alignment.calls()[0].inputs, vec![work.path().join("S1").join("input").join("S1.bam")]);
    Ok(())
}


#[tokio::test]
async fn test_input_checks_can_be_disabled() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, calling) = stages();
    let mut config = config(work.path());
    config.check_inputs_exist = false;
    let orchestrator = orchestrator(config, store.clone(), alignment, calling);

    let finished = orchestrator.execute(run("S1", work.path())).await;
    assert_eq!(finished.status, RunStatus::Complete);
    assert_eq!(store.stats.load(std::sync::atomic::Ordering::SeqCst), 0);
    Ok(())
}


#[tokio::test]
async fn test_staging_failure_uploads_nothing() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    store.set_faults(Faults { corrupt_downloads: 2, ..Faults::default() });
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling);

    let finished = orchestrator.execute(run("S1", work.path())).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().stage, STAGING_STAGE);
    assert!(alignment.calls().is_empty());
    assert_eq!(store.uploads(), 0);
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_output_count_mismatch_fails_upload() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling);
    let mut run = run("S1", work.path());
    run.output_locations = vec!["gs://out/S1.vcf.gz".parse().unwrap()];

    let finished = orchestrator.execute(run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().stage, UPLOAD_STAGE);
    assert_eq!(store.uploads(), 0);
    Ok(())
}


#[tokio::test]
async fn test_invalid_run_rejected_before_any_transfer() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling);
    let mut run = run("S1", work.path());
    run.output_locations.clear();

    let finished = orchestrator.execute(run).await;

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.failure.unwrap().stage, PREFLIGHT_STAGE);
    assert_eq!(store.downloads(), 0);
    Ok(())
}


#[tokio::test]
async fn test_concurrent_runs_are_isolated() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["A", "B", "C"]);
    let alignment = Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"]).with_delay(Duration::from_millis(20)));
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let runs = vec![run("A", work.path()), run("B", work.path()), run("C", work.path())];
    let finished = orchestrator.execute_batch(runs, 2).await;

    let ids: Vec<&str> = finished.iter().map(|r| r.sample_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
    for run in &finished {
        assert_eq!(run.status, RunStatus::Complete);
        let expected = format!("gs://out/results/{}.vcf.gz", run.sample_id);
        assert_eq!(run.uploaded.iter().map(|p| p.to_string()).collect::<Vec<_>>(), vec![expected.clone()]);
        assert_eq!(store.get(&expected), Some(format!("calling {} vcf.gz", run.sample_id).into_bytes()));
    }
    for call in alignment.calls().iter().chain(calling.calls().iter()) {
        let own = work.path().join(&call.sample_id);
        assert!(call.stage_dir.starts_with(&own));
        assert!(call.inputs.iter().all(|p| p.starts_with(&own)));
    }
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_one_failure_does_not_affect_other_runs() -> Result<()> {
    let work = TempDir::new()?;
    // B has no input object.
    let store = store_with_inputs(&["A", "C"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling);

    let runs = vec![run("A", work.path()), run("B", work.path()), run("C", work.path())];
    let finished = orchestrator.execute_batch(runs, 3).await;

    let statuses: Vec<RunStatus> = finished.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RunStatus::Complete, RunStatus::Failed, RunStatus::Complete]);
    assert!(finished[1].uploaded.is_empty());
    Ok(())
}


#[tokio::test]
async fn test_duplicate_sample_in_batch_rejected() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["A"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling);

    let finished = orchestrator.execute_batch(vec![run("A", work.path()), run("A", work.path())], 2).await;

    assert_eq!(finished[0].status, RunStatus::Complete);
    assert_eq!(finished[1].status, RunStatus::Failed);
    assert_eq!(finished[1].failure.as_ref().unwrap().stage, PREFLIGHT_STAGE);
    Ok(())
}


#[tokio::test]
async fn test_same_sample_in_separate_executes_never_shares_scratch() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let alignment = Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"]).with_delay(Duration::from_millis(50)));
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let (a, b) = tokio::join!(
        orchestrator.execute(run("S1", work.path())),
        orchestrator.execute(run("S1", work.path())),
    );

    let (done, refused) = if a.status == RunStatus::Complete { (a, b) } else { (b, a) };
    assert_eq!(done.status, RunStatus::Complete);
    assert_eq!(refused.status, RunStatus::Failed);
    assert_eq!(refused.failure.as_ref().unwrap().stage, PREFLIGHT_STAGE);
    assert_eq!(alignment.calls().len(), 1);
    assert_eq!(calling.calls().len(), 1);
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_cancellation_lets_running_tool_finish() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let cancel = CancelToken::new();
    let alignment = Arc::new(MockStage::new(ALIGNMENT_STAGE, &["bam"]).cancelling(cancel.clone()));
    let calling = Arc::new(MockStage::new(CALLING_STAGE, &["vcf.gz"]));
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment.clone(), calling.clone());

    let finished = orchestrator.execute_with_cancel(run("S1", work.path()), &cancel).await;

    assert_eq!(finished.status, RunStatus::Failed);
    let failure = finished.failure.unwrap();
    assert!(failure.cancelled);
    assert_eq!(failure.error, "cancelled");
    assert_eq!(failure.stage, CALLING_STAGE);
    // The alignment that was running when the cancel arrived completed.
    assert!(finished.stage_results.iter().any(|r| r.stage_name == ALIGNMENT_STAGE && r.is_success()));
    assert!(calling.calls().is_empty());
    assert_eq!(store.uploads(), 0);
    assert!(leftovers(work.path()).is_empty());
    Ok(())
}


#[tokio::test]
async fn test_cancelled_before_start() -> Result<()> {
    let work = TempDir::new()?;
    let store = store_with_inputs(&["S1"]);
    let (alignment, calling) = stages();
    let orchestrator = orchestrator(config(work.path()), store.clone(), alignment, calling);
    let cancel = CancelToken::new();
    cancel.cancel();

    let finished = orchestrator.execute_with_cancel(run("S1", work.path()), &cancel).await;

    assert_eq!(finished.history, vec![RunStatus::Pending, RunStatus::Failed]);
    assert!(finished.failure.unwrap().cancelled);
    assert_eq!(store.downloads(), 0);
    Ok(())
}


#[tokio::test]
async fn test_end_to_end_with_local_store_and_real_tools() -> Result<()> {
    let root = TempDir::new()?;
    let work = root.path().join("work");
    let bucket_dir = root.path().join("data");
    std::fs::create_dir_all(bucket_dir.join("in"))?;
    std::fs::write(bucket_dir.join("in").join("S1.sam"), "r3\nr1\nr2\nr1\n")?;

    let profiles = ProfileSet::from_json(
        r#"{
            "germline": {
                "alignment": {
                    "commands": [
                        {"program": "cat", "args": ["{inputs}"]},
                        {"program": "sort"},
                        {"program": "uniq"}
                    ],
                    "stdout_artifact": "{sample_id}.bam"
                },
                "calling": {
                    "commands": [{"program": "sh", "args": ["-c", "wc -l < \"$0\" > \"$1\"", "{input}", "{output}"]}],
                    "artifacts": ["{sample_id}.vcf"]
                }
            }
        }"#,
    )?;
    let base = format!("file://{}", bucket_dir.display());
    let run = PipelineRun::parse(
        "S1",
        "DNAscope",
        &[format!("{}/in/S1.sam", base)],
        &[format!("{}/out/", base)],
        &work,
    )?;

    let credentials = Arc::new(CredentialProvider::new(Arc::new(EphemeralIssuer::default())));
    let orchestrator = Orchestrator::new(Arc::new(config(&work)), credentials, Arc::new(LocalStore), Arc::new(profiles));
    let finished = orchestrator.execute(run).await;

    assert_eq!(finished.status, RunStatus::Complete, "{:?}", finished.failure);
    assert_eq!(std::fs::read_to_string(bucket_dir.join("out").join("S1.vcf"))?.trim(), "3");
    assert!(leftovers(&work).is_empty());
    Ok(())
}
