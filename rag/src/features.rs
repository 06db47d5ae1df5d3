//! Mergeable feature accumulators and the classifier-facing feature vector.
//!
//! Every region and every boundary carries a [`FeatureSet`]: a voxel count, the
//! per-channel value sums, and one [`Accumulator`] per (channel, feature kind).
//! Accumulators combine by addition, so merging two regions never rescans voxels
//! and the order of merges does not change the result.

use std::str::FromStr;
use std::sync::Arc;

use common::FloatExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RagError, RagResult};
use crate::region_graph::{EdgeId, RegionGraph};

/// Quantiles reported by histograms with `compute_percentiles` set.
pub const PERCENTILES: [f64; 5] = [0.1, 0.3, 0.5, 0.7, 0.9];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum FeatureName {
    Histogram,
    Moments,
    Inclusiveness,
}

impl FeatureName {
    pub fn parse(name: &str) -> RagResult<Self> {
        FeatureName::from_str(name).map_err(|_| RagError::UnsupportedFeatureKind(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    Histogram {
        nbins: usize,
        compute_percentiles: bool,
    },
    Moments {
        nmoments: usize,
        use_diff: bool,
    },
    Inclusiveness,
}

impl FeatureKind {
    pub fn name(&self) -> FeatureName {
        match self {
            FeatureKind::Histogram { .. } => FeatureName::Histogram,
            FeatureKind::Moments { .. } => FeatureName::Moments,
            FeatureKind::Inclusiveness => FeatureName::Inclusiveness,
        }
    }

    pub fn validate(&self) -> RagResult<()> {
        match *self {
            FeatureKind::Histogram { nbins: 0, .. } => Err(RagError::InvalidFeatureParameter {
                feature: self.name().into(),
                message: "nbins must be greater than zero".to_string(),
            }),
            FeatureKind::Moments { nmoments: 0, .. } => Err(RagError::InvalidFeatureParameter {
                feature: self.name().into(),
                message: "nmoments must be greater than zero".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Whether the kind is computed from probability values (once per channel)
    /// rather than from the graph structure.
    pub fn is_voxel_based(&self) -> bool {
        !matches!(self, FeatureKind::Inclusiveness)
    }

    fn uses_diff(&self) -> bool {
        matches!(self, FeatureKind::Moments { use_diff: true, .. })
    }

    /// Length of the vector extracted from one accumulator.
    fn extract_len(&self) -> usize {
        match *self {
            FeatureKind::Histogram {
                nbins,
                compute_percentiles,
            } => nbins + if compute_percentiles { PERCENTILES.len() } else { 0 },
            FeatureKind::Moments { nmoments, .. } => nmoments + 1,
            FeatureKind::Inclusiveness => 2,
        }
    }

    /// Length this kind contributes to an edge vector for one channel.
    fn edge_len(&self) -> usize {
        if !self.is_voxel_based() {
            return self.extract_len();
        }
        let parts = if self.uses_diff() { 4 } else { 3 };
        self.extract_len() * parts
    }

    fn new_accumulator(&self) -> Accumulator {
        match *self {
            FeatureKind::Histogram { nbins, .. } => Accumulator::Histogram(vec![0; nbins]),
            FeatureKind::Moments { nmoments, .. } => Accumulator::Moments(vec![0.0; nmoments]),
            FeatureKind::Inclusiveness => Accumulator::Inclusiveness,
        }
    }
}

/// Sufficient statistics for one feature kind over one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// Bin counts over `[0, 1]`.
    Histogram(Vec<u64>),
    /// Power sums `Σv^k` for `k = 1..=nmoments`.
    Moments(Vec<f64>),
    Inclusiveness,
}

impl Accumulator {
    fn same_shape(&self, other: &Accumulator) -> bool {
        match (self, other) {
            (Accumulator::Histogram(a), Accumulator::Histogram(b)) => a.len() == b.len(),
            (Accumulator::Moments(a), Accumulator::Moments(b)) => a.len() == b.len(),
            (Accumulator::Inclusiveness, Accumulator::Inclusiveness) => true,
            _ => false,
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Accumulator::Histogram(bins) => {
                let nbins = bins.len();
                let v = value.to_unit_interval().unwrap_or(0.0);
                let bin = ((v * nbins as f64) as usize).min(nbins - 1);
                bins[bin] += 1;
            }
            Accumulator::Moments(sums) => {
                let mut power = 1.0;
                for sum in sums.iter_mut() {
                    power *= value;
                    *sum += power;
                }
            }
            Accumulator::Inclusiveness => {}
        }
    }

    fn combine(&mut self, other: &Accumulator) {
        match (self, other) {
            (Accumulator::Histogram(a), Accumulator::Histogram(b)) => {
                assert_eq!(a.len(), b.len(), "histogram bin count mismatch");
                a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
            }
            (Accumulator::Moments(a), Accumulator::Moments(b)) => {
                assert_eq!(a.len(), b.len(), "moment count mismatch");
                a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
            }
            (Accumulator::Inclusiveness, Accumulator::Inclusiveness) => {}
            (a, b) => panic!("Accumulator kind mismatch: {a:?} vs {b:?}"),
        }
    }

    fn extract_into(&self, kind: &FeatureKind, count: u64, out: &mut Vec<f64>) {
        match (self, kind) {
            (
                Accumulator::Histogram(bins),
                FeatureKind::Histogram {
                    compute_percentiles,
                    ..
                },
            ) => {
                let total = count.max(1) as f64;
                out.extend(bins.iter().map(|&c| c as f64 / total));
                if *compute_percentiles {
                    out.extend(PERCENTILES.iter().map(|&q| histogram_quantile(bins, q)));
                }
            }
            (Accumulator::Moments(sums), FeatureKind::Moments { .. }) => {
                out.push(count as f64);
                out.extend(central_moments(sums, count));
            }
            (a, k) => panic!("Accumulator {a:?} does not belong to feature {k:?}"),
        }
    }
}

/// Linear interpolation of quantile `q` inside the histogram bin that reaches it.
fn histogram_quantile(bins: &[u64], q: f64) -> f64 {
    let total: u64 = bins.iter().sum();
    if total == 0 {
        return 0.0;
    }

    let width = 1.0 / bins.len() as f64;
    let target = q * total as f64;
    let mut before = 0.0;
    for (idx, &count) in bins.iter().enumerate() {
        let after = before + count as f64;
        if count > 0 && after >= target {
            let within = ((target - before) / count as f64).clamp(0.0, 1.0);
            return (idx as f64 + within) * width;
        }
        before = after;
    }

    1.0
}

/// Mean followed by central moments 2..=n, derived from raw power sums.
fn central_moments(sums: &[f64], count: u64) -> Vec<f64> {
    if count == 0 {
        return vec![0.0; sums.len()];
    }

    let n = count as f64;
    let raw: Vec<f64> = sums.iter().map(|s| s / n).collect();
    let mean = raw[0];
    let mut out = Vec::with_capacity(sums.len());
    out.push(mean);

    for k in 2..=sums.len() {
        let mut binom = 1.0;
        let mut moment = 0.0;
        for j in 0..=k {
            let e_j = if j == 0 { 1.0 } else { raw[j - 1] };
            moment += binom * e_j * (-mean).powi((k - j) as i32);
            binom = binom * (k - j) as f64 / (j + 1) as f64;
        }
        out.push(moment);
    }

    out
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    count: u64,
    channel_sums: Vec<f64>,
    accumulators: Vec<Accumulator>,
}

impl FeatureSet {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self, channel: usize) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        self.channel_sums
            .get(channel)
            .map(|sum| sum / self.count as f64)
    }

    pub fn accumulators(&self) -> &[Accumulator] {
        &self.accumulators
    }

    /// Adds `other` into `self`. Associative and commutative.
    pub fn combine(&mut self, other: &FeatureSet) {
        if other.channel_sums.is_empty() && other.accumulators.is_empty() {
            self.count += other.count;
            return;
        }
        if self.channel_sums.is_empty() && self.accumulators.is_empty() {
            let count = self.count;
            *self = other.clone();
            self.count += count;
            return;
        }

        assert_eq!(self.channel_sums.len(), other.channel_sums.len());
        assert_eq!(self.accumulators.len(), other.accumulators.len());

        self.count += other.count;
        self.channel_sums
            .iter_mut()
            .zip(&other.channel_sums)
            .for_each(|(a, b)| *a += b);
        self.accumulators
            .iter_mut()
            .zip(&other.accumulators)
            .for_each(|(a, b)| a.combine(b));
    }
}

/// Classifier collaborator: feature vector in, boundary probability out.
pub trait Classifier: Send + Sync {
    fn predict(&self, features: &[f64]) -> f64;
}

impl<F> Classifier for F
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn predict(&self, features: &[f64]) -> f64 {
        self(features)
    }
}

/// What the manager needs to know about one edge to build its vector.
#[derive(Debug, Clone, Copy)]
pub struct EdgeContext<'a> {
    pub edge: &'a FeatureSet,
    pub small: &'a FeatureSet,
    pub large: &'a FeatureSet,
    pub edge_boundary: u64,
    pub small_boundary: u64,
    pub large_boundary: u64,
}

#[derive(Clone)]
pub struct FeatureManager {
    channels: usize,
    kinds: Vec<FeatureKind>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl std::fmt::Debug for FeatureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureManager")
            .field("channels", &self.channels)
            .field("kinds", &self.kinds)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl FeatureManager {
    pub fn new(
        channels: usize,
        kinds: Vec<FeatureKind>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> RagResult<Self> {
        if channels == 0 {
            return Err(RagError::ChannelCountMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if classifier.is_some() && kinds.is_empty() {
            return Err(RagError::MissingFeatureConfiguration);
        }
        for kind in kinds.iter() {
            kind.validate()?;
        }

        Ok(Self {
            channels,
            kinds,
            classifier,
        })
    }

    /// Manager scoring edges by their mean boundary probability.
    pub fn mean_boundary(channels: usize) -> RagResult<Self> {
        Self::new(channels, Vec::new(), None)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn feature_len(&self) -> usize {
        self.kinds
            .iter()
            .map(|kind| {
                if kind.is_voxel_based() {
                    kind.edge_len() * self.channels
                } else {
                    kind.edge_len()
                }
            })
            .sum()
    }

    pub fn new_set(&self) -> FeatureSet {
        let mut accumulators = Vec::with_capacity(self.channels * self.kinds.len());
        for _ in 0..self.channels {
            accumulators.extend(self.kinds.iter().map(FeatureKind::new_accumulator));
        }

        FeatureSet {
            count: 0,
            channel_sums: vec![0.0; self.channels],
            accumulators,
        }
    }

    /// Whether `set` was accumulated with this manager's channels and feature kinds.
    pub fn matches(&self, set: &FeatureSet) -> bool {
        let fresh = self.new_set();
        set.channel_sums.len() == fresh.channel_sums.len()
            && set.accumulators.len() == fresh.accumulators.len()
            && set
                .accumulators
                .iter()
                .zip(fresh.accumulators.iter())
                .all(|(a, b)| a.same_shape(b))
    }

    /// Folds one voxel (one value per channel) into `set`.
    pub fn accumulate(&self, set: &mut FeatureSet, values: &[f64]) {
        debug_assert_eq!(values.len(), self.channels);
        debug_assert_eq!(set.channel_sums.len(), self.channels);

        set.count += 1;
        let per_channel = self.kinds.len();
        for (channel, &value) in values.iter().enumerate() {
            set.channel_sums[channel] += value;
            for acc in set.accumulators[channel * per_channel..(channel + 1) * per_channel]
                .iter_mut()
            {
                acc.add(value);
            }
        }
    }

    /// Builds the classifier input for one edge.
    ///
    /// Per channel and voxel-based kind: `edge ++ small ++ large`, then
    /// `|small - large|` when the kind asks for it. Structural kinds follow once.
    pub fn edge_features(&self, ctx: &EdgeContext<'_>) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.feature_len());
        let per_channel = self.kinds.len();

        for channel in 0..self.channels {
            for (k, kind) in self.kinds.iter().enumerate() {
                if !kind.is_voxel_based() {
                    continue;
                }
                let idx = channel * per_channel + k;
                let start = out.len();
                ctx.edge.accumulators[idx].extract_into(kind, ctx.edge.count, &mut out);
                let small_start = out.len();
                ctx.small.accumulators[idx].extract_into(kind, ctx.small.count, &mut out);
                let large_start = out.len();
                ctx.large.accumulators[idx].extract_into(kind, ctx.large.count, &mut out);

                if kind.uses_diff() {
                    let len = large_start - small_start;
                    for i in 0..len {
                        let diff = (out[small_start + i] - out[large_start + i]).abs();
                        out.push(diff);
                    }
                }
                debug_assert_eq!(out.len() - start, kind.edge_len());
            }
        }

        for kind in self.kinds.iter().filter(|kind| !kind.is_voxel_based()) {
            debug_assert_eq!(*kind, FeatureKind::Inclusiveness);
            let ratio = |total: u64| {
                if total == 0 {
                    0.0
                } else {
                    ctx.edge_boundary as f64 / total as f64
                }
            };
            let a = ratio(ctx.small_boundary);
            let b = ratio(ctx.large_boundary);
            out.push(a.min(b));
            out.push(a.max(b));
        }

        debug_assert_eq!(out.len(), self.feature_len());
        out
    }

    /// Probability that the edge is a true boundary.
    pub fn score(&self, ctx: &EdgeContext<'_>) -> f64 {
        let raw = match &self.classifier {
            Some(classifier) => classifier.predict(&self.edge_features(ctx)),
            None => ctx.edge.mean(0).unwrap_or(1.0),
        };

        raw.to_unit_interval().unwrap_or_else(|| {
            warn!("Classifier returned NaN, treating edge as a true boundary");
            1.0
        })
    }

    pub fn merge_probability(&self, graph: &RegionGraph, edge: EdgeId) -> f64 {
        let ctx = graph.edge_context(edge);
        self.score(&ctx)
    }
}
