use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rstest::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::core::client::command::{CommandError, CommandSpec, MockCommandExecutor};
use crate::core::client::database::{DatabaseError, JobQueue};
use crate::error::job::JobError;
use crate::pipeline::reconstruction::FFPROBE;
use crate::tests::common::{reconstruction_payload, tool_name, MemoryJobQueue, ScriptedExecutor, ScriptedRun};
use crate::tests::config::{TestConfigBuilder, TEST_MAKEFILE};
use crate::types::jobs::types::{JobId, JobState};
use crate::worker::config::{FailurePolicy, SweepMode};
use crate::worker::run_worker;
use crate::worker::runner::{JobRunner, CONFIG_ENV, MAKE, PROJECT_ID_ENV};
use crate::worker::worker::SweepSummary;
use crate::OrchestratorError;

fn env_var(spec: &CommandSpec, key: &str) -> Option<String> {
    spec.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.to_string_lossy().into_owned())
}

/// Fails the project whose id is `failing`, completes every other one
fn failing_project(failing: &'static str) -> ScriptedExecutor {
    ScriptedExecutor::new(move |spec| match env_var(spec, PROJECT_ID_ENV).as_deref() {
        Some(id) if id == failing => ScriptedRun::exit(1).lines(["make: *** [splat] Error 1"]),
        _ => ScriptedRun::success(),
    })
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[rstest]
#[tokio::test]
async fn makefile_job_completes_with_its_output_logged() {
    let executor = Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success().lines(["building frames", "done"])));
    let services = TestConfigBuilder::new().configure_executor(executor.clone()).build();
    let id = services.queue.insert(reconstruction_payload());

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 1, failed: 0 });
    assert_eq!(services.queue.state_of(id), JobState::Complete);
    assert_eq!(services.queue.messages(id), vec!["building frames", "done"]);
    assert_eq!(services.queue.list_partitions().await.unwrap(), vec![id.partition_id()]);

    let spawned = executor.spawned();
    assert_eq!(spawned.len(), 1);
    let spec = &spawned[0];
    assert_eq!(spec.program, MAKE);
    assert_eq!(spec.args, vec!["-f", TEST_MAKEFILE]);
    assert_eq!(spec.cwd.as_deref(), Some(services.workspace.path().join(id.partition_id()).as_path()));
    assert_eq!(env_var(spec, PROJECT_ID_ENV), Some(id.to_string()));
    let config: Value = serde_json::from_str(&env_var(spec, CONFIG_ENV).unwrap()).unwrap();
    assert_eq!(config, reconstruction_payload());
}

#[rstest]
#[tokio::test]
async fn failing_makefile_fails_the_job_with_a_final_log_line() {
    let executor = Arc::new(ScriptedExecutor::new(|_| ScriptedRun::exit(2).lines(["colmap: not enough matches"])));
    let services = TestConfigBuilder::new().configure_executor(executor).build();
    let id = services.queue.insert(reconstruction_payload());

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 0, failed: 1 });
    assert_eq!(services.queue.state_of(id), JobState::Failed);
    assert_eq!(
        services.queue.messages(id),
        vec![
            "colmap: not enough matches".to_string(),
            JobError::ProcessFailed { id, exit_code: Some(2) }.to_string(),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn spawn_errors_fail_the_job() {
    let mut executor = MockCommandExecutor::new();
    executor.expect_spawn().times(1).returning(|spec| {
        Err(CommandError::SpawnFailed {
            program: spec.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        })
    });
    let services = TestConfigBuilder::new().configure_executor(Arc::new(executor)).build();
    let id = services.queue.insert(reconstruction_payload());

    let result = JobRunner::new(services.config.clone()).process_job(id, &CancellationToken::new()).await;

    assert_matches!(result, Err(JobError::CommandError(CommandError::SpawnFailed { .. })));
    assert_eq!(services.queue.state_of(id), JobState::Failed);
    assert!(services.queue.messages(id).last().unwrap().contains("Failed to start make"));
}

#[rstest]
#[tokio::test]
async fn invalid_config_fails_the_job_without_spawning() {
    let mut executor = MockCommandExecutor::new();
    executor.expect_spawn().never();
    let services = TestConfigBuilder::new().configure_executor(Arc::new(executor)).build();
    let id = services.queue.insert(json!({ "pipeline": "reconstruction", "frames": {} }));

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 0, failed: 1 });
    assert_eq!(services.queue.state_of(id), JobState::Failed);
    assert!(services.queue.messages(id)[0].starts_with(&format!("Invalid config for job {id}")));
}

#[rstest]
#[tokio::test]
async fn cancellation_kills_the_job_and_stops_the_worker() {
    let executor = Arc::new(ScriptedExecutor::new(|_| ScriptedRun::hang().lines(["training"])));
    let services = TestConfigBuilder::new().configure_executor(executor.clone()).build();
    let first = services.queue.insert(reconstruction_payload());
    let second = services.queue.insert(reconstruction_payload());

    let shutdown = CancellationToken::new();
    cancel_after(&shutdown, Duration::from_millis(50));
    let summary =
        tokio::time::timeout(Duration::from_secs(5), run_worker(services.config.clone(), shutdown)).await.unwrap();

    assert_eq!(summary.unwrap(), SweepSummary { completed: 0, failed: 1 });
    assert_eq!(services.queue.state_of(first), JobState::Failed);
    assert_eq!(services.queue.state_of(second), JobState::Pending);
    assert_eq!(
        services.queue.messages(first),
        vec!["training".to_string(), JobError::Cancelled { id: first }.to_string()]
    );
    assert_eq!(executor.spawned().len(), 1);
}

#[rstest]
#[traced_test]
#[tokio::test]
async fn job_timeout_kills_the_process() {
    let executor = Arc::new(ScriptedExecutor::new(|_| ScriptedRun::hang()));
    let services =
        TestConfigBuilder::new().configure_executor(executor).job_timeout(Duration::from_millis(100)).build();
    let id = services.queue.insert(reconstruction_payload());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        JobRunner::new(services.config.clone()).process_job(id, &CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_matches!(result, Err(JobError::TimedOut { id: timed_out, .. }) if timed_out == id);
    assert_eq!(services.queue.state_of(id), JobState::Failed);
    assert!(logs_contain("Job timed out, stopping it"));
}

#[rstest]
#[tokio::test]
async fn job_moved_by_someone_else_is_reported_as_claim_race() {
    let queue = Arc::new(MemoryJobQueue::new());
    let id = queue.insert(reconstruction_payload());
    let operator = queue.clone();
    let executor = ScriptedExecutor::new(move |_| {
        operator.set_state(id, JobState::Failed);
        ScriptedRun::success()
    });
    let services = TestConfigBuilder::new().configure_queue(queue).configure_executor(Arc::new(executor)).build();

    let result = JobRunner::new(services.config.clone()).process_job(id, &CancellationToken::new()).await;

    assert_matches!(
        result,
        Err(JobError::DatabaseError(DatabaseError::ClaimRace { found: JobState::Failed, .. }))
    );
    assert_eq!(services.queue.state_of(id), JobState::Failed);
}

#[rstest]
#[tokio::test]
async fn continue_policy_runs_every_job() {
    let services = TestConfigBuilder::new().configure_executor(Arc::new(failing_project("2"))).build();
    let ids: Vec<JobId> = (0..3).map(|_| services.queue.insert(reconstruction_payload())).collect();

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 2, failed: 1 });
    let states: Vec<JobState> = ids.iter().map(|id| services.queue.state_of(*id)).collect();
    assert_eq!(states, vec![JobState::Complete, JobState::Failed, JobState::Complete]);
}

#[rstest]
#[traced_test]
#[tokio::test]
async fn halt_policy_stops_at_the_first_failure() {
    let services = TestConfigBuilder::new()
        .configure_executor(Arc::new(failing_project("2")))
        .failure_policy(FailurePolicy::Halt)
        .build();
    let ids: Vec<JobId> = (0..3).map(|_| services.queue.insert(reconstruction_payload())).collect();

    let result = run_worker(services.config.clone(), CancellationToken::new()).await;

    assert_matches!(
        result,
        Err(OrchestratorError::JobError(JobError::ProcessFailed { id, exit_code: Some(1) })) if id == ids[1]
    );
    let states: Vec<JobState> = ids.iter().map(|id| services.queue.state_of(*id)).collect();
    assert_eq!(states, vec![JobState::Complete, JobState::Failed, JobState::Pending]);
    assert!(logs_contain("Halting sweep after failed job"));
}

#[rstest]
#[tokio::test]
async fn poll_mode_keeps_picking_up_new_jobs_until_shutdown() {
    let services = TestConfigBuilder::new().sweep_mode(SweepMode::Poll).build();
    let first = services.queue.insert(reconstruction_payload());

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(run_worker(services.config.clone(), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = services.queue.insert(reconstruction_payload());
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap().unwrap();
    assert_eq!(summary, SweepSummary { completed: 2, failed: 0 });
    assert_eq!(services.queue.state_of(first), JobState::Complete);
    assert_eq!(services.queue.state_of(second), JobState::Complete);
}

#[rstest]
#[tokio::test]
async fn drain_mode_returns_on_an_empty_queue() {
    let services = TestConfigBuilder::new().build();
    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();
    assert_eq!(summary, SweepSummary::default());
}

#[rstest]
#[tokio::test]
async fn process_job_refuses_running_jobs() {
    let mut executor = MockCommandExecutor::new();
    executor.expect_spawn().never();
    let services = TestConfigBuilder::new().configure_executor(Arc::new(executor)).build();
    let id = services.queue.insert(reconstruction_payload());
    services.queue.set_state(id, JobState::Running);

    let result = JobRunner::new(services.config.clone()).process_job(id, &CancellationToken::new()).await;

    assert_matches!(result, Err(JobError::InvalidState { state: JobState::Running, .. }));
    assert_eq!(services.queue.state_of(id), JobState::Running);
    assert!(services.queue.messages(id).is_empty());
}

#[rstest]
#[case(JobState::Failed)]
#[case(JobState::Complete)]
#[case(JobState::Pending)]
#[tokio::test]
async fn process_job_reruns_jobs_that_are_not_running(#[case] state: JobState) {
    let services = TestConfigBuilder::new().build();
    let id = services.queue.insert(reconstruction_payload());
    services.queue.set_state(id, state);

    JobRunner::new(services.config.clone()).process_job(id, &CancellationToken::new()).await.unwrap();

    assert_eq!(services.queue.state_of(id), JobState::Complete);
}

#[rstest]
#[tokio::test]
async fn graph_mode_publishes_every_stage() {
    let executor = Arc::new(ScriptedExecutor::pipeline(120));
    let services = TestConfigBuilder::new().graph_mode().configure_executor(executor.clone()).build();
    let id = services.queue.insert(reconstruction_payload());
    services.storage.insert(&format!("{id}/scan.mp4"), &b"video"[..]);

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 1, failed: 0 });
    assert_eq!(services.queue.state_of(id), JobState::Complete);
    assert!(services.storage.keys().contains(&format!("{id}/splat.zip.index")));
    assert!(services.workspace.path().join(id.partition_id()).join("splat").is_dir());

    let messages = services.queue.messages(id);
    assert_eq!(messages[0], "Pulled file scan.mp4");
    assert!(messages.contains(&"gaussian_splatting_cuda done".to_string()));
    assert!(!executor.tools().contains(&MAKE.to_string()));
}

#[rstest]
#[tokio::test]
async fn graph_mode_failure_keeps_the_stage_output_in_the_job_log() {
    let executor = ScriptedExecutor::new(|spec| match tool_name(spec).as_str() {
        FFPROBE => ScriptedRun::success().lines(["120"]),
        "extract_frames.py" => ScriptedRun::exit(1).lines(["cannot decode scan.mp4"]),
        _ => ScriptedRun::success(),
    });
    let services = TestConfigBuilder::new().graph_mode().configure_executor(Arc::new(executor)).build();
    let id = services.queue.insert(reconstruction_payload());
    services.storage.insert(&format!("{id}/scan.mp4"), &b"video"[..]);

    let summary = run_worker(services.config.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(summary, SweepSummary { completed: 0, failed: 1 });
    assert_eq!(services.queue.state_of(id), JobState::Failed);
    let messages = services.queue.messages(id);
    assert!(messages.contains(&"cannot decode scan.mp4".to_string()));
    assert!(messages.last().unwrap().contains("Stage frames failed with exit code Some(1)"));
    assert!(!services.storage.keys().contains(&format!("{id}/frames.zip")));
}

#[rstest]
#[tokio::test]
async fn ensure_stage_builds_only_what_the_stage_needs() {
    let executor = Arc::new(ScriptedExecutor::pipeline(40));
    let services = TestConfigBuilder::new().graph_mode().configure_executor(executor.clone()).build();
    let id = services.queue.insert(reconstruction_payload());
    services.storage.insert(&format!("{id}/scan.mp4"), &b"video"[..]);

    let path =
        JobRunner::new(services.config.clone()).ensure_stage(id, "pairing", &CancellationToken::new()).await.unwrap();

    assert_eq!(path, services.workspace.path().join(id.partition_id()).join("pairing"));
    assert_eq!(executor.tools(), vec!["ffprobe", "extract_frames.py", "pair_exhaustive.py"]);
    assert_eq!(services.queue.state_of(id), JobState::Pending);
}

#[rstest]
#[tokio::test]
async fn ensure_stage_rejects_unknown_stages() {
    let services = TestConfigBuilder::new().graph_mode().build();
    let id = services.queue.insert(reconstruction_payload());

    let result = JobRunner::new(services.config.clone()).ensure_stage(id, "meshing", &CancellationToken::new()).await;

    assert_matches!(result, Err(JobError::PipelineError(crate::pipeline::PipelineError::UnknownStage(stage))) if stage == "meshing");
}
