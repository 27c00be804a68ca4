//! The reconstruction pipeline: uploaded videos to a gaussian splat.
//!
//! ```text
//! frames ─┬─> pairing ─┬─> feature_matching ─┐
//!         │            │                     v
//!         └────────────┴──────────────────> colmap ──> splat
//! ```
//!
//! Every stage shells out to the tools in the scripts directory; the computer vision itself
//! happens there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::core::client::command::CommandSpec;
use crate::pipeline::error::PipelineError;
use crate::pipeline::graph::{PipelineGraph, Stage};
use crate::pipeline::stage::{StageAction, StageContext};
use crate::types::jobs::config::{FrameSelection, MatchingConfig, PairingConfig, ReconstructionConfig};

pub const FRAMES_STAGE: &str = "frames";
pub const PAIRING_STAGE: &str = "pairing";
pub const FEATURE_MATCHING_STAGE: &str = "feature_matching";
pub const COLMAP_STAGE: &str = "colmap";
pub const SPLAT_STAGE: &str = "splat";

/// The stage a project run ends with
pub const TERMINAL_STAGE: &str = SPLAT_STAGE;

/// Uploaded videos are pulled into `<workspace>/<partition>/uploads`
pub const UPLOADS_DIR: &str = "uploads";

pub const FFPROBE: &str = "ffprobe";
pub const SPLAT_TRAINER: &str = "gaussian_splatting_cuda";

pub const PAIRS_FILE: &str = "pairs.txt";
pub const FEATURES_FILE: &str = "features.h5";
pub const MATCHES_FILE: &str = "matches.h5";
/// Undistorted model the splat trainer reads, inside the colmap artifact
pub const PINHOLE_MODEL_DIR: &str = "colmap-pinhole";

pub fn reconstruction_graph(config: &ReconstructionConfig) -> Result<PipelineGraph, PipelineError> {
    PipelineGraph::builder()
        .stage(Stage::new(FRAMES_STAGE, Frames { uploads: config.uploads.clone() }))
        .stage(Stage::new(PAIRING_STAGE, Pairing { pairing: config.pairing.clone() }).depends_on(FRAMES_STAGE))
        .stage(
            Stage::new(FEATURE_MATCHING_STAGE, FeatureMatching { matching: config.matching.clone() })
                .depends_on(FRAMES_STAGE)
                .depends_on(PAIRING_STAGE),
        )
        .stage(
            Stage::new(COLMAP_STAGE, Colmap { min_match_score: config.min_match_score })
                .depends_on(FRAMES_STAGE)
                .depends_on(PAIRING_STAGE)
                .depends_on(FEATURE_MATCHING_STAGE),
        )
        .stage(Stage::new(SPLAT_STAGE, Splat { num_iter: config.num_iter }).depends_on(COLMAP_STAGE).indexed())
        .build()
}

/// Pulls every upload and extracts the selected frames of each into one directory.
pub struct Frames {
    pub uploads: BTreeMap<String, FrameSelection>,
}

impl Frames {
    async fn frame_count(&self, ctx: &StageContext, video: &Path) -> Result<u64, PipelineError> {
        let spec = CommandSpec::new(FFPROBE)
            .args(["-v", "error", "-select_streams", "v:0", "-count_packets"])
            .args(["-show_entries", "stream=nb_read_packets", "-of", "csv=p=0"])
            .arg(video);
        let output = ctx.capture(spec).await?;

        output.iter().find_map(|line| line.trim_end_matches(',').parse::<u64>().ok()).ok_or_else(|| {
            PipelineError::InvalidInput {
                stage: ctx.stage.clone(),
                reason: format!("could not read the frame count of {}", video.display()),
            }
        })
    }
}

#[async_trait]
impl StageAction for Frames {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        let uploads_dir = ctx.partition_dir().join(UPLOADS_DIR);

        for (upload, selection) in &self.uploads {
            let video = uploads_dir.join(upload);
            ctx.store().pull_file(&video, &format!("{}/{}", ctx.partition_id, upload), false).await?;
            ctx.log(&format!("Pulled file {upload}")).await?;

            let total_frames = match selection {
                FrameSelection::Num { .. } => self.frame_count(ctx, &video).await?,
                FrameSelection::List { .. } => 0,
            };
            let frames = selection.frame_indices(total_frames);
            if frames.is_empty() {
                return Err(PipelineError::InvalidInput {
                    stage: ctx.stage.clone(),
                    reason: format!("no frames selected from {upload}"),
                });
            }

            let frame_list = frame_list_path(&uploads_dir, upload);
            let content: String = frames.iter().map(|frame| format!("{frame}\n")).collect();
            tokio::fs::write(&frame_list, content).await?;

            ctx.run(ctx.script("extract_frames.py")?.arg(&video).arg(&ctx.output_dir).arg(&frame_list)).await?;
        }

        Ok(())
    }
}

fn frame_list_path(uploads_dir: &Path, upload: &str) -> PathBuf {
    uploads_dir.join(format!("{upload}.frames"))
}

/// Image pairs to match: every pair, or sequential neighbours plus retrieval candidates.
pub struct Pairing {
    pub pairing: PairingConfig,
}

#[async_trait]
impl StageAction for Pairing {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        let frames = ctx.input(FRAMES_STAGE)?;
        let pairs = ctx.output_dir.join(PAIRS_FILE);

        match &self.pairing {
            PairingConfig::Exhaustive => {
                ctx.run(ctx.script("pair_exhaustive.py")?.arg("-i").arg(frames).arg("-o").arg(&pairs)).await?;
            }
            PairingConfig::Complex { sequential, retrieval } => {
                let mut pair_files = Vec::new();

                if *sequential > 0 {
                    let sequential_pairs = ctx.output_dir.join("sequential.txt");
                    let spec = ctx
                        .script("pair_sequential.py")?
                        .arg("-i")
                        .arg(frames)
                        .arg("-o")
                        .arg(&sequential_pairs)
                        .arg("-n")
                        .arg(sequential.to_string());
                    ctx.run(spec).await?;
                    pair_files.push(sequential_pairs);
                }

                if *retrieval > 0 {
                    let retrieval_pairs = ctx.output_dir.join("retrieval.txt");
                    let spec = ctx
                        .script("pair_retrieval.py")?
                        .arg("-i")
                        .arg(frames)
                        .arg("-f")
                        .arg(ctx.output_dir.join("features.bin"))
                        .arg("-p")
                        .arg(&retrieval_pairs)
                        .arg("-n")
                        .arg(retrieval.to_string());
                    ctx.run(spec).await?;
                    pair_files.push(retrieval_pairs);
                }

                ctx.run(ctx.script("pair_merge.py")?.arg("-o").arg(&pairs).args(&pair_files)).await?;
            }
        }

        Ok(())
    }
}

pub struct FeatureMatching {
    pub matching: MatchingConfig,
}

#[async_trait]
impl StageAction for FeatureMatching {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        let frames = ctx.input(FRAMES_STAGE)?;
        let pairs = ctx.input(PAIRING_STAGE)?.join(PAIRS_FILE);
        let features = ctx.output_dir.join(FEATURES_FILE);
        let matches = ctx.output_dir.join(MATCHES_FILE);

        let extract = ctx
            .script("extract_features.py")?
            .arg("-i")
            .arg(frames)
            .arg("-f")
            .arg(&features)
            .arg("-c")
            .arg(self.matching.features().to_string());
        ctx.run(extract).await?;

        let mut matcher = ctx
            .script("match_features.py")?
            .arg("-p")
            .arg(&pairs)
            .arg("-f")
            .arg(&features)
            .arg("-m")
            .arg(&matches)
            .arg("-c")
            .arg(self.matching.matcher());
        if let MatchingConfig::Superglue { weights, iterations, .. } = &self.matching {
            matcher = matcher.arg("--weights").arg(weights.to_string()).arg("--iterations").arg(iterations.to_string());
        }
        ctx.run(matcher).await
    }
}

/// Imports the matches into a colmap database and runs the mapper.
pub struct Colmap {
    pub min_match_score: Option<f64>,
}

#[async_trait]
impl StageAction for Colmap {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        let frames = ctx.input(FRAMES_STAGE)?;
        let matching = ctx.input(FEATURE_MATCHING_STAGE)?;

        let mut prepare = ctx
            .script("prepare_db.py")?
            .arg("-i")
            .arg(frames)
            .arg("-o")
            .arg(&ctx.output_dir)
            .arg("-p")
            .arg(ctx.input(PAIRING_STAGE)?.join(PAIRS_FILE))
            .arg("-f")
            .arg(matching.join(FEATURES_FILE))
            .arg("-m")
            .arg(matching.join(MATCHES_FILE));
        if let Some(score) = self.min_match_score {
            prepare = prepare.arg("-ms").arg(score.to_string());
        }
        ctx.run(prepare).await?;

        ctx.run(ctx.script("mapper.sh")?.arg(frames).arg(&ctx.output_dir)).await
    }
}

pub struct Splat {
    pub num_iter: u32,
}

#[async_trait]
impl StageAction for Splat {
    async fn execute(&self, ctx: &StageContext) -> Result<(), PipelineError> {
        let spec = CommandSpec::new(SPLAT_TRAINER)
            .arg("-d")
            .arg(ctx.input(COLMAP_STAGE)?.join(PINHOLE_MODEL_DIR))
            .arg("-o")
            .arg(&ctx.output_dir)
            .arg("-i")
            .arg(self.num_iter.to_string())
            .cwd(ctx.partition_dir());
        ctx.run(spec).await
    }
}
