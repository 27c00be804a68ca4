use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use rstest::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactStore};
use crate::core::client::command::{CommandExecutor, CommandSpec};
use crate::pipeline::graph::STAGING_DIR;
use crate::pipeline::reconstruction::{reconstruction_graph, TERMINAL_STAGE, UPLOADS_DIR};
use crate::pipeline::{ExecutionEnv, LogSink, PipelineError, PipelineGraph, Stage, StageAction, StageContext};
use crate::tests::common::{tool_name, write_tree, MemoryStorage, ScriptedExecutor, ScriptedRun, StorageRequest};
use crate::types::jobs::config::{
    FeatureType, FrameSelection, MatchingConfig, PairingConfig, ReconstructionConfig, SuperglueWeights,
};

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn write_line(&self, line: &str) -> Result<(), PipelineError> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Counts its runs and writes `<stage>` (prefixed with the upstream output) to `out.txt`
struct WriteOutput {
    runs: Arc<AtomicUsize>,
    upstream: Option<&'static str>,
}

impl WriteOutput {
    fn new(runs: &Arc<AtomicUsize>) -> Self {
        Self { runs: runs.clone(), upstream: None }
    }

    fn reading(runs: &Arc<AtomicUsize>, upstream: &'static str) -> Self {
        Self { runs: runs.clone(), upstream: Some(upstream) }
    }
}

#[async_trait]
impl StageAction for WriteOutput {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut content = String::new();
        if let Some(upstream) = self.upstream {
            content = tokio::fs::read_to_string(ctx.input(upstream)?.join("out.txt")).await?;
            content.push('>');
        }
        content.push_str(&ctx.stage);
        tokio::fs::write(ctx.output_dir.join("out.txt"), content).await?;
        Ok(())
    }
}

/// Runs `tool <output dir>` through the executor
struct RunTool;

#[async_trait]
impl StageAction for RunTool {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        ctx.run(CommandSpec::new("tool").arg(&ctx.output_dir)).await
    }
}

struct Harness {
    storage: Arc<MemoryStorage>,
    sink: Arc<RecordingSink>,
    workspace: TempDir,
    env: ExecutionEnv,
}

impl Harness {
    fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let sink = Arc::new(RecordingSink::default());
        let workspace = TempDir::new().unwrap();
        let env = ExecutionEnv {
            store: ArtifactStore::new(storage.clone(), workspace.path()),
            executor,
            log: sink.clone(),
            cancel: CancellationToken::new(),
            scripts_dir: "/opt/splat/bin".into(),
        };
        Self { storage, sink, workspace, env }
    }

    fn partition_dir(&self, partition_id: &str) -> std::path::PathBuf {
        self.workspace.path().join(partition_id)
    }

    fn puts(&self) -> Vec<String> {
        self.storage
            .requests()
            .into_iter()
            .filter_map(|request| match request {
                StorageRequest::Put(key) => Some(key),
                _ => None,
            })
            .collect()
    }
}

fn two_stage_graph(a: impl StageAction + 'static, b: impl StageAction + 'static) -> PipelineGraph {
    PipelineGraph::builder().stage(Stage::new("a", a)).stage(Stage::new("b", b).depends_on("a")).build().unwrap()
}

#[rstest]
#[tokio::test]
async fn ensured_stages_are_not_run_again() {
    let harness = Harness::new(Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success())));
    let (runs_a, runs_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let graph = two_stage_graph(WriteOutput::new(&runs_a), WriteOutput::reading(&runs_b, "a"));

    let path = graph.ensure(&harness.env, "1", "b").await.unwrap();

    assert_eq!(path, harness.partition_dir("1").join("b"));
    assert_eq!(std::fs::read_to_string(path.join("out.txt")).unwrap(), "a>b");
    assert_eq!(harness.puts(), vec!["1/a.zip".to_string(), "1/b.zip".to_string()]);
    assert!(!harness.partition_dir("1").join(STAGING_DIR).join("b").exists());

    harness.storage.clear_requests();
    graph.ensure(&harness.env, "1", "b").await.unwrap();
    graph.ensure(&harness.env, "1", "a").await.unwrap();

    assert_eq!(runs_a.load(Ordering::SeqCst), 1);
    assert_eq!(runs_b.load(Ordering::SeqCst), 1);
    assert!(harness.storage.requests().is_empty(), "cached stages must not touch the store");
}

#[rstest]
#[tokio::test]
async fn partitions_are_cached_independently() {
    let harness = Harness::new(Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success())));
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = PipelineGraph::builder().stage(Stage::new("a", WriteOutput::new(&runs))).build().unwrap();

    graph.ensure(&harness.env, "1", "a").await.unwrap();
    graph.ensure(&harness.env, "2", "a").await.unwrap();
    graph.ensure(&harness.env, "1", "a").await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[rstest]
#[tokio::test]
async fn remote_artifacts_are_pulled_instead_of_run() {
    let harness = Harness::new(Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success())));
    let published = TempDir::new().unwrap();
    write_tree(published.path(), &[("out.txt", b"remote-a")]);
    harness.env.store.push(published.path(), &Artifact::new("1", "a"), false).await.unwrap();
    harness.storage.clear_requests();

    let (runs_a, runs_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let graph = two_stage_graph(WriteOutput::new(&runs_a), WriteOutput::reading(&runs_b, "a"));

    let path = graph.ensure(&harness.env, "1", "b").await.unwrap();

    assert_eq!(runs_a.load(Ordering::SeqCst), 0);
    assert_eq!(runs_b.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_to_string(path.join("out.txt")).unwrap(), "remote-a>b");
    assert!(harness.storage.requests().contains(&StorageRequest::Get("1/a.zip".to_string())));
    assert_eq!(harness.puts(), vec!["1/b.zip".to_string()]);
}

#[rstest]
#[tokio::test]
async fn remote_target_is_pulled_without_looking_upstream() {
    let harness = Harness::new(Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success())));
    let published = TempDir::new().unwrap();
    write_tree(published.path(), &[("out.txt", b"remote-b")]);
    harness.env.store.push(published.path(), &Artifact::new("1", "b"), false).await.unwrap();
    harness.storage.clear_requests();

    let (runs_a, runs_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let graph = two_stage_graph(WriteOutput::new(&runs_a), WriteOutput::reading(&runs_b, "a"));

    let path = graph.ensure(&harness.env, "1", "b").await.unwrap();

    assert_eq!(std::fs::read_to_string(path.join("out.txt")).unwrap(), "remote-b");
    assert_eq!(runs_a.load(Ordering::SeqCst) + runs_b.load(Ordering::SeqCst), 0);
    assert!(!harness.partition_dir("1").join("a").exists());
    assert!(!harness.storage.requests().contains(&StorageRequest::Head("1/a.zip".to_string())));
}

#[rstest]
#[tokio::test]
async fn failing_stage_stops_the_walk_and_publishes_nothing() {
    let executor = ScriptedExecutor::new(|_| ScriptedRun::exit(2).lines(["loading frames", "boom"]));
    let harness = Harness::new(Arc::new(executor));
    let runs_b = Arc::new(AtomicUsize::new(0));
    let graph = two_stage_graph(RunTool, WriteOutput::reading(&runs_b, "a"));

    let result = graph.ensure(&harness.env, "1", "b").await;

    assert_matches!(
        result,
        Err(PipelineError::StageFailure { stage, exit_code: Some(2), output })
            if stage == "a" && output == vec!["loading frames".to_string(), "boom".to_string()]
    );
    assert_eq!(runs_b.load(Ordering::SeqCst), 0);
    assert!(harness.puts().is_empty());
    assert!(!harness.partition_dir("1").join("a").exists());
    assert!(!harness.partition_dir("1").join(STAGING_DIR).join("a").exists());
    assert_eq!(harness.sink.lines(), vec!["loading frames", "boom"]);
}

#[rstest]
#[tokio::test]
async fn failure_output_keeps_only_the_last_lines() {
    let executor = ScriptedExecutor::new(|_| ScriptedRun::exit(1).lines((0..80).map(|i| format!("line {i}"))));
    let harness = Harness::new(Arc::new(executor));
    let graph = PipelineGraph::builder().stage(Stage::new("a", RunTool)).build().unwrap();

    let result = graph.ensure(&harness.env, "1", "a").await;

    let Err(PipelineError::StageFailure { output, .. }) = result else {
        panic!("expected a stage failure");
    };
    assert_eq!(output.len(), crate::pipeline::stage::FAILURE_OUTPUT_LINES);
    assert_eq!(output.last().map(String::as_str), Some("line 79"));
    assert_eq!(harness.sink.lines().len(), 80);
}

#[rstest]
#[tokio::test]
async fn cancellation_kills_the_running_stage() {
    let executor = Arc::new(ScriptedExecutor::new(|_| ScriptedRun::hang().lines(["started"])));
    let harness = Harness::new(executor.clone());
    let graph = PipelineGraph::builder().stage(Stage::new("a", RunTool)).build().unwrap();

    let cancel = harness.env.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), graph.ensure(&harness.env, "1", "a")).await.unwrap();

    assert_matches!(result, Err(PipelineError::Cancelled { stage }) if stage == "a");
    assert_eq!(executor.spawned().len(), 1);
    assert!(harness.puts().is_empty());
    assert!(!harness.partition_dir("1").join(STAGING_DIR).join("a").exists());
}

#[rstest]
#[case("")]
#[case("../other")]
#[tokio::test]
async fn invalid_partitions_are_rejected_before_any_work(#[case] partition_id: &str) {
    let harness = Harness::new(Arc::new(ScriptedExecutor::new(|_| ScriptedRun::success())));
    let runs = Arc::new(AtomicUsize::new(0));
    let graph = PipelineGraph::builder().stage(Stage::new("a", WriteOutput::new(&runs))).build().unwrap();

    assert_matches!(graph.ensure(&harness.env, partition_id, "a").await, Err(PipelineError::InvalidPartition(_)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(harness.storage.requests().is_empty());
}

fn reconstruction_config(pairing: PairingConfig, matching: MatchingConfig) -> ReconstructionConfig {
    ReconstructionConfig {
        uploads: BTreeMap::from([("scan.mp4".to_string(), FrameSelection::Num { num: 10 })]),
        pairing,
        matching,
        min_match_score: None,
        num_iter: 300,
    }
}

fn args_of(spec: &CommandSpec) -> Vec<String> {
    spec.args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect()
}

#[rstest]
#[tokio::test]
async fn reconstruction_runs_every_tool_and_publishes_an_indexed_splat() {
    let executor = Arc::new(ScriptedExecutor::pipeline(120));
    let harness = Harness::new(executor.clone());
    harness.storage.insert("7/scan.mp4", &b"video"[..]);
    let config = reconstruction_config(PairingConfig::Exhaustive, MatchingConfig::default());

    let path = reconstruction_graph(&config).unwrap().ensure(&harness.env, "7", TERMINAL_STAGE).await.unwrap();

    assert_eq!(path, harness.partition_dir("7").join("splat"));
    assert_eq!(
        executor.tools(),
        vec![
            "ffprobe",
            "extract_frames.py",
            "pair_exhaustive.py",
            "extract_features.py",
            "match_features.py",
            "prepare_db.py",
            "mapper.sh",
            "gaussian_splatting_cuda",
        ]
    );

    let uploads = harness.partition_dir("7").join(UPLOADS_DIR);
    assert_eq!(std::fs::read(uploads.join("scan.mp4")).unwrap(), b"video");
    let frames: Vec<u64> = std::fs::read_to_string(uploads.join("scan.mp4.frames"))
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();
    assert_eq!(frames, (0..10).map(|i| i * 12).collect::<Vec<u64>>());

    let keys = harness.storage.keys();
    for stage in ["frames", "pairing", "feature_matching", "colmap", "splat"] {
        assert!(keys.contains(&format!("7/{stage}.zip")), "{stage} was not published");
    }
    assert!(keys.contains(&"7/splat.zip.index".to_string()));
    assert!(!keys.contains(&"7/colmap.zip.index".to_string()));
    assert!(harness.sink.lines().contains(&"Pulled file scan.mp4".to_string()));
    assert!(!harness.sink.lines().contains(&"120".to_string()), "captured output is not logged");

    let spawned = executor.spawned();
    let splat = spawned.last().unwrap();
    assert_eq!(splat.cwd.as_deref(), Some(harness.partition_dir("7").as_path()));
    let splat_args = args_of(splat);
    assert!(Path::new(&splat_args[1]).ends_with("colmap/colmap-pinhole"));
    assert_eq!(&splat_args[4..], ["-i", "300"]);
}

#[rstest]
#[tokio::test]
async fn complex_pairing_and_superglue_options_reach_the_tools() {
    let executor = Arc::new(ScriptedExecutor::pipeline(50));
    let harness = Harness::new(executor.clone());
    harness.storage.insert("3/scan.mp4", &b"video"[..]);
    let mut config = reconstruction_config(
        PairingConfig::Complex { sequential: 5, retrieval: 10 },
        MatchingConfig::Superglue {
            features: FeatureType::Superpoint,
            weights: SuperglueWeights::Outdoor,
            iterations: 40,
        },
    );
    config.min_match_score = Some(0.5);

    reconstruction_graph(&config).unwrap().ensure(&harness.env, "3", "colmap").await.unwrap();

    let spawned = executor.spawned();
    let by_tool = |tool: &str| spawned.iter().find(|spec| tool_name(spec) == tool).map(args_of).unwrap();

    let sequential = by_tool("pair_sequential.py");
    assert_eq!(&sequential[sequential.len() - 2..], ["-n", "5"]);
    let retrieval = by_tool("pair_retrieval.py");
    assert_eq!(&retrieval[retrieval.len() - 2..], ["-n", "10"]);
    let merge = by_tool("pair_merge.py");
    assert!(merge.iter().any(|arg| arg.ends_with("sequential.txt")));
    assert!(merge.iter().any(|arg| arg.ends_with("retrieval.txt")));

    let extract = by_tool("extract_features.py");
    assert_eq!(extract.last().map(String::as_str), Some("superpoint"));
    let matcher = by_tool("match_features.py");
    assert_eq!(&matcher[matcher.len() - 6..], ["-c", "superglue", "--weights", "outdoor", "--iterations", "40"]);
    let prepare = by_tool("prepare_db.py");
    assert_eq!(&prepare[prepare.len() - 2..], ["-ms", "0.5"]);

    assert!(!executor.tools().contains(&"gaussian_splatting_cuda".to_string()), "splat is downstream of colmap");
}
