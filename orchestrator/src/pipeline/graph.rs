//! Per-partition DAG of named stages.
//!
//! Every stage produces exactly one artifact per partition, named after the stage. Ensuring a
//! stage walks its ancestors: anything already materialized locally is reused, anything that only
//! exists remotely is pulled, and the rest runs in dependency order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::pipeline::error::PipelineError;
use crate::pipeline::stage::{ExecutionEnv, StageAction, StageContext};

/// Stage outputs are built under `<workspace>/<partition>/.staging/<stage>` and only renamed to
/// their final path once pushed.
pub const STAGING_DIR: &str = ".staging";

#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub dependencies: Vec<String>,
    /// Upload the member index next to the archive
    pub indexed: bool,
    pub action: Arc<dyn StageAction>,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: impl StageAction + 'static) -> Self {
        Self { name: name.into(), dependencies: Vec::new(), indexed: false, action: Arc::new(action) }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.dependencies.push(stage.into());
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("indexed", &self.indexed)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct PipelineGraphBuilder {
    stages: Vec<Stage>,
}

impl PipelineGraphBuilder {
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<PipelineGraph, PipelineError> {
        let mut stages = BTreeMap::new();
        for stage in self.stages {
            if stages.contains_key(&stage.name) {
                return Err(PipelineError::DuplicateStage(stage.name));
            }
            stages.insert(stage.name.clone(), stage);
        }

        for stage in stages.values() {
            if let Some(dependency) = stage.dependencies.iter().find(|d| !stages.contains_key(*d)) {
                return Err(PipelineError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let graph = PipelineGraph { stages };
        for name in graph.stages.keys() {
            graph.execution_order(name)?;
        }
        Ok(graph)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// What ensuring a stage has to do for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Pull,
    Run,
}

#[derive(Debug)]
pub struct PipelineGraph {
    stages: BTreeMap<String, Stage>,
}

impl PipelineGraph {
    pub fn builder() -> PipelineGraphBuilder {
        PipelineGraphBuilder::default()
    }

    pub fn stage(&self, name: &str) -> Result<&Stage, PipelineError> {
        self.stages.get(name).ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// `target` and all of its ancestors, every stage after its dependencies
    pub fn execution_order(&self, target: &str) -> Result<Vec<&Stage>, PipelineError> {
        let mut visits = HashMap::new();
        let mut order = Vec::new();
        let mut path = Vec::new();
        self.visit(self.stage(target)?, &mut visits, &mut path, &mut order)?;
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        stage: &'a Stage,
        visits: &mut HashMap<&'a str, Visit>,
        path: &mut Vec<String>,
        order: &mut Vec<&'a Stage>,
    ) -> Result<(), PipelineError> {
        match visits.get(stage.name.as_str()) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = path.iter().position(|name| *name == stage.name).unwrap_or_default();
                let mut cycle = path[start..].to_vec();
                cycle.push(stage.name.clone());
                return Err(PipelineError::Cycle(cycle));
            }
            None => {}
        }

        visits.insert(&stage.name, Visit::InProgress);
        path.push(stage.name.clone());
        for dependency in &stage.dependencies {
            self.visit(self.stage(dependency)?, visits, path, order)?;
        }
        path.pop();
        visits.insert(&stage.name, Visit::Done);
        order.push(stage);
        Ok(())
    }

    /// Make the artifact of `target` available locally for `partition_id` and return its path.
    ///
    /// A stage whose artifact is already materialized is never re-run, and its ancestors are not
    /// looked at. Stages run one at a time. A failing stage stops the walk before any downstream
    /// stage starts and publishes nothing.
    pub async fn ensure(&self, env: &ExecutionEnv, partition_id: &str, target: &str) -> Result<PathBuf, PipelineError> {
        validate_partition_id(partition_id)?;
        let order = self.execution_order(target)?;
        let plans = self.plan(env, partition_id, target).await?;

        for stage in order {
            let Some(plan) = plans.get(stage.name.as_str()) else {
                continue;
            };
            let artifact = Artifact::new(partition_id, &stage.name);
            match plan {
                Plan::Pull => {
                    env.store.pull(&env.store.local_path(&artifact), &artifact, false).await?;
                }
                Plan::Run => self.run_stage(env, stage, &artifact).await?,
            }
        }

        Ok(env.store.local_path(&Artifact::new(partition_id, target)))
    }

    /// Decide, from the target upwards, which stages need a pull or a run. The walk stops at
    /// stages that are available locally or remotely.
    async fn plan(
        &self,
        env: &ExecutionEnv,
        partition_id: &str,
        target: &str,
    ) -> Result<HashMap<String, Plan>, PipelineError> {
        let mut plans = HashMap::new();
        let mut seen = HashSet::new();
        let mut pending = vec![target.to_string()];

        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let stage = self.stage(&name)?;
            let artifact = Artifact::new(partition_id, &name);

            if env.store.exists(&artifact) {
                debug!(partition = %partition_id, stage = %name, "Stage artifact present locally");
                continue;
            }
            if env.store.exists_remote(&artifact).await? {
                debug!(partition = %partition_id, stage = %name, "Stage artifact found remotely");
                plans.insert(name, Plan::Pull);
                continue;
            }

            pending.extend(stage.dependencies.iter().cloned());
            plans.insert(name, Plan::Run);
        }

        Ok(plans)
    }

    async fn run_stage(&self, env: &ExecutionEnv, stage: &Stage, artifact: &Artifact) -> Result<(), PipelineError> {
        let partition_dir = env.store.workspace().join(&artifact.partition_id);
        let staging = partition_dir.join(STAGING_DIR).join(&stage.name);
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let inputs = stage
            .dependencies
            .iter()
            .map(|dependency| {
                let path = env.store.local_path(&Artifact::new(&artifact.partition_id, dependency));
                (dependency.clone(), path)
            })
            .collect();
        let ctx = StageContext::new(&artifact.partition_id, &stage.name, staging.clone(), inputs, env.clone());

        info!(partition = %artifact.partition_id, stage = %stage.name, "Running stage");
        let published = match stage.action.execute(&ctx).await {
            Ok(()) => env.store.push(&staging, artifact, stage.indexed).await.map_err(PipelineError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            discard(&staging).await;
            return Err(e);
        }

        let final_path = env.store.local_path(artifact);
        if tokio::fs::try_exists(&final_path).await? {
            tokio::fs::remove_dir_all(&final_path).await?;
        }
        tokio::fs::rename(&staging, &final_path).await?;

        info!(partition = %artifact.partition_id, stage = %stage.name, "Stage completed");
        Ok(())
    }
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!(path = %staging.display(), error = %e, "Failed to remove stage staging directory");
    }
}

/// Partition ids name a directory under the workspace and a key prefix in the bucket.
pub fn validate_partition_id(partition_id: &str) -> Result<(), PipelineError> {
    let valid = !partition_id.is_empty()
        && !partition_id.starts_with('.')
        && !partition_id.contains(['/', '\\'])
        && partition_id.chars().all(|c| !c.is_control());
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidPartition(partition_id.to_string()))
    }
}
