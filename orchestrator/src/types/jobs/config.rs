use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_FRAME_COUNT: u32 = 100;
pub const DEFAULT_NUM_ITER: u32 = 7000;

/// Pipeline configuration of a project job, tagged by pipeline type.
///
/// Validated when the job is enqueued and decoded once when the job is claimed, so stages
/// never interpret raw payloads themselves.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "pipeline", rename_all = "snake_case")]
pub enum JobConfig {
    /// Video uploads to gaussian splat: frames, pairing, feature matching, colmap, splat
    Reconstruction(ReconstructionConfig),
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobConfig::Reconstruction(config) => config.validate(),
        }
    }

    pub fn pipeline_name(&self) -> &'static str {
        match self {
            JobConfig::Reconstruction(_) => "reconstruction",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructionConfig {
    /// Frame selection per uploaded video, keyed by upload name
    #[serde(rename = "frames")]
    pub uploads: BTreeMap<String, FrameSelection>,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub min_match_score: Option<f64>,
    #[serde(default = "default_num_iter")]
    pub num_iter: u32,
}

fn default_num_iter() -> u32 {
    DEFAULT_NUM_ITER
}

impl ReconstructionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.uploads.is_empty() {
            return Err("at least one upload is required".to_string());
        }
        for (name, selection) in &self.uploads {
            if name.is_empty() || name.contains("..") || name.starts_with('/') {
                return Err(format!("invalid upload name {name:?}"));
            }
            match selection {
                FrameSelection::Num { num: 0 } => return Err(format!("upload {name}: frame count must be positive")),
                FrameSelection::List { frames } if frames.is_empty() => {
                    return Err(format!("upload {name}: frame list is empty"))
                }
                _ => {}
            }
        }
        if let PairingConfig::Complex { sequential: 0, retrieval: 0 } = self.pairing {
            return Err("complex pairing needs sequential or retrieval pairs".to_string());
        }
        self.matching.validate()?;
        if let Some(score) = self.min_match_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(format!("min match score {score} is outside [0, 1]"));
            }
        }
        if self.num_iter == 0 {
            return Err("num_iter must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameSelection {
    /// Evenly spaced frames over the whole video
    Num { num: u32 },
    /// Explicit frame indices
    List { frames: Vec<u64> },
}

impl Default for FrameSelection {
    fn default() -> Self {
        FrameSelection::Num { num: DEFAULT_FRAME_COUNT }
    }
}

impl FrameSelection {
    /// Frame indices to extract from a video of `total_frames` frames, ascending and unique.
    /// Asking for more frames than the video has selects every frame.
    pub fn frame_indices(&self, total_frames: u64) -> Vec<u64> {
        match self {
            FrameSelection::Num { num } => {
                let num = u64::from(*num).min(total_frames);
                (0..num).map(|i| i * total_frames / num).collect()
            }
            FrameSelection::List { frames } => {
                let mut frames = frames.clone();
                frames.sort_unstable();
                frames.dedup();
                frames
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingConfig {
    #[default]
    Exhaustive,
    Complex {
        #[serde(default)]
        sequential: u32,
        #[serde(default)]
        retrieval: u32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureType {
    Superpoint,
    Disk,
    Colmap,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SuperglueWeights {
    Indoor,
    Outdoor,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchingConfig {
    Lightglue { features: FeatureType },
    Superglue { features: FeatureType, weights: SuperglueWeights, iterations: u32 },
    Colmap { features: FeatureType },
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig::Colmap { features: FeatureType::Colmap }
    }
}

impl MatchingConfig {
    pub fn features(&self) -> FeatureType {
        match self {
            MatchingConfig::Lightglue { features }
            | MatchingConfig::Superglue { features, .. }
            | MatchingConfig::Colmap { features } => *features,
        }
    }

    /// Matcher name passed to the matching script
    pub fn matcher(&self) -> &'static str {
        match self {
            MatchingConfig::Lightglue { .. } => "lightglue",
            MatchingConfig::Superglue { .. } => "superglue",
            MatchingConfig::Colmap { .. } => "colmap",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            MatchingConfig::Lightglue { features: FeatureType::Colmap }
            | MatchingConfig::Superglue { features: FeatureType::Colmap, .. } => {
                Err(format!("{} matching does not support colmap features", self.matcher()))
            }
            _ => Ok(()),
        }
    }
}
