use std::path::Path;

use common::FileFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};
use crate::features::{FeatureKind, FeatureName};

/// How the engine treats edges flagged `false_edge`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FalseEdgePolicy {
    /// Never merged automatically; reported with weight 1.0 and no location.
    #[default]
    ReportOnly,
    /// Scored 0.0 and merged ahead of every other edge.
    MergeFirst,
}

/// Which endpoint keeps its id when two regions merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorRule {
    /// Larger region survives, lower id on ties.
    #[default]
    Larger,
    LowerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgglomerationConfig {
    /// Edges merge while their boundary probability is strictly below this.
    pub threshold: f64,
    pub false_edge_policy: FalseEdgePolicy,
    pub survivor: SurvivorRule,
    /// Optional cap on merges per run.
    pub max_merges: Option<usize>,
}

impl Default for AgglomerationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            false_edge_policy: FalseEdgePolicy::default(),
            survivor: SurvivorRule::default(),
            max_merges: None,
        }
    }
}

impl AgglomerationConfig {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> RagResult<Self> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RagResult<()> {
        if !self.threshold.is_finite() {
            return Err(RagError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> RagResult<T> {
    let format = FileFormat::from_file_name(&path.to_string_lossy())?;
    let text = std::fs::read_to_string(path)?;
    Ok(common::deserialize(&text, format)?)
}

#[derive(Debug, Deserialize)]
struct HistogramParams {
    nbins: usize,
    #[serde(default)]
    compute_percentiles: bool,
}

#[derive(Debug, Deserialize)]
struct MomentParams {
    nmoments: usize,
    #[serde(default)]
    use_diff: bool,
}

/// Ordered feature list in the `{"feature_list": [...], "<name>": {...}}` layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureConfig {
    pub features: Vec<FeatureKind>,
}

impl FeatureConfig {
    pub fn new(features: Vec<FeatureKind>) -> Self {
        Self { features }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn from_json_str(text: &str) -> RagResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn from_file(path: impl AsRef<Path>) -> RagResult<Self> {
        let value: serde_json::Value = load_file(path.as_ref())?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &serde_json::Value) -> RagResult<Self> {
        let list = value
            .get("feature_list")
            .and_then(|list| list.as_array())
            .ok_or(RagError::MissingFeatureConfiguration)?;

        let mut features = Vec::with_capacity(list.len());
        for entry in list {
            let name = entry.as_str().ok_or_else(|| {
                RagError::UnsupportedFeatureKind(entry.to_string())
            })?;
            let kind = match FeatureName::parse(name)? {
                FeatureName::Histogram => {
                    let params: HistogramParams = params(value, FeatureName::Histogram)?;
                    FeatureKind::Histogram {
                        nbins: params.nbins,
                        compute_percentiles: params.compute_percentiles,
                    }
                }
                FeatureName::Moments => {
                    let params: MomentParams = params(value, FeatureName::Moments)?;
                    FeatureKind::Moments {
                        nmoments: params.nmoments,
                        use_diff: params.use_diff,
                    }
                }
                FeatureName::Inclusiveness => FeatureKind::Inclusiveness,
            };
            kind.validate()?;
            features.push(kind);
        }

        Ok(Self { features })
    }
}

fn params<T: DeserializeOwned>(value: &serde_json::Value, name: FeatureName) -> RagResult<T> {
    let feature: &'static str = name.into();
    let block = value
        .get(feature)
        .ok_or_else(|| RagError::InvalidFeatureParameter {
            feature,
            message: "missing parameter block".to_string(),
        })?;

    serde_json::from_value(block.clone()).map_err(|err| RagError::InvalidFeatureParameter {
        feature,
        message: err.to_string(),
    })
}
