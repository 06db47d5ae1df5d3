//! Single-pass construction of a [`RegionGraph`] from a watershed volume.

use std::ops::Range;

use common::parallel::{par_fold_slabs, ParSlicesMutAuto};
use common::Buffer3;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use rayon::prelude::*;

use crate::error::{RagError, RagResult};
use crate::features::{FeatureManager, FeatureSet};
use crate::region_graph::{EdgeId, NodeId, RegionEdge, RegionGraph, RegionNode, BACKGROUND_SLOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    #[default]
    Sequential,
    /// Scan z-slabs on the rayon pool and reduce the partial graphs.
    Parallel,
}

#[derive(Debug)]
struct NodeStats {
    size: u64,
    touches_border: bool,
    features: FeatureSet,
}

impl NodeStats {
    fn combine(&mut self, other: NodeStats) {
        self.size += other.size;
        self.touches_border |= other.touches_border;
        self.features.combine(&other.features);
    }
}

#[derive(Debug)]
struct EdgeStats {
    boundary: u64,
    features: FeatureSet,
    location_sum: [u64; 3],
}

impl EdgeStats {
    fn combine(&mut self, other: EdgeStats) {
        self.boundary += other.boundary;
        self.features.combine(&other.features);
        for (a, b) in self.location_sum.iter_mut().zip(other.location_sum) {
            *a += b;
        }
    }
}

/// Nodes and edges seen in one part of the volume, keyed by raw label.
#[derive(Debug, Default)]
struct PartialRag {
    nodes: HashMap<u32, NodeStats>,
    edges: HashMap<(u32, u32), EdgeStats>,
}

impl PartialRag {
    fn merge(mut self, other: PartialRag) -> PartialRag {
        for (label, stats) in other.nodes {
            match self.nodes.entry(label) {
                Entry::Occupied(mut entry) => entry.get_mut().combine(stats),
                Entry::Vacant(entry) => {
                    entry.insert(stats);
                }
            }
        }
        for (key, stats) in other.edges {
            match self.edges.entry(key) {
                Entry::Occupied(mut entry) => entry.get_mut().combine(stats),
                Entry::Vacant(entry) => {
                    entry.insert(stats);
                }
            }
        }
        self
    }
}

/// Scans unpadded slices `z_range` of the padded volumes.
///
/// Each face is visited once, from its lower voxel, so slabs never double count.
fn scan_slab(
    labels: &Buffer3<u32>,
    channels: &[Buffer3<f64>],
    fmgr: &FeatureManager,
    z_range: Range<usize>,
) -> PartialRag {
    let (pw, ph, _) = labels.dims();
    let (w, h, d) = (pw - 2, ph - 2, labels.depth() - 2);
    let neighbor_offsets = [1, pw, labels.slice_len()];

    let mut partial = PartialRag::default();
    let mut values = vec![0.0; channels.len()];
    let mut other_values = vec![0.0; channels.len()];

    for z in z_range {
        for y in 0..h {
            for x in 0..w {
                let idx = labels.index(x + 1, y + 1, z + 1);
                let label = labels[idx];
                if label == 0 {
                    continue;
                }

                for (value, channel) in values.iter_mut().zip(channels) {
                    *value = channel[idx];
                }

                let node = partial.nodes.entry(label).or_insert_with(|| NodeStats {
                    size: 0,
                    touches_border: false,
                    features: fmgr.new_set(),
                });
                node.size += 1;
                node.touches_border |=
                    x == 0 || y == 0 || z == 0 || x + 1 == w || y + 1 == h || z + 1 == d;
                fmgr.accumulate(&mut node.features, &values);

                for offset in neighbor_offsets {
                    let other_idx = idx + offset;
                    let other = labels[other_idx];
                    if other == 0 || other == label {
                        continue;
                    }

                    for (value, channel) in other_values.iter_mut().zip(channels) {
                        *value = channel[other_idx];
                    }

                    let edge = partial
                        .edges
                        .entry((label.min(other), label.max(other)))
                        .or_insert_with(|| EdgeStats {
                            boundary: 0,
                            features: fmgr.new_set(),
                            location_sum: [0; 3],
                        });
                    edge.boundary += 1;
                    fmgr.accumulate(&mut edge.features, &values);
                    fmgr.accumulate(&mut edge.features, &other_values);
                    edge.location_sum[0] += x as u64;
                    edge.location_sum[1] += y as u64;
                    edge.location_sum[2] += z as u64;
                }
            }
        }
    }

    partial
}

impl RegionGraph {
    /// Builds the graph in one pass over `labels` (0 is background).
    ///
    /// `channels` are probability volumes of the same shape, one per channel
    /// the manager was configured with. Both are padded by one voxel internally.
    pub fn build(
        labels: &Buffer3<u32>,
        channels: &[Buffer3<f64>],
        fmgr: &FeatureManager,
        mode: BuildMode,
    ) -> RagResult<RegionGraph> {
        if channels.len() != fmgr.channels() {
            return Err(RagError::ChannelCountMismatch {
                expected: fmgr.channels(),
                actual: channels.len(),
            });
        }
        for (channel, volume) in channels.iter().enumerate() {
            if !volume.same_shape(labels) {
                return Err(RagError::ChannelShapeMismatch {
                    channel,
                    expected: labels.dims(),
                    actual: volume.dims(),
                });
            }
        }

        let padded_labels = labels.padded(1, 0);
        let padded_channels: Vec<Buffer3<f64>> =
            channels.iter().map(|volume| volume.padded(1, 0.0)).collect();

        let depth = labels.depth();
        let partial = match mode {
            BuildMode::Sequential => scan_slab(&padded_labels, &padded_channels, fmgr, 0..depth),
            BuildMode::Parallel => par_fold_slabs(
                depth,
                |range| scan_slab(&padded_labels, &padded_channels, fmgr, range),
                PartialRag::merge,
            )
            .unwrap_or_default(),
        };

        let mut node_stats: Vec<(u32, NodeStats)> = partial.nodes.into_iter().collect();
        node_stats.sort_unstable_by_key(|(label, _)| *label);
        let slot_by_label: HashMap<u32, u32> = node_stats
            .iter()
            .enumerate()
            .map(|(slot, (label, _))| (*label, slot as u32))
            .collect();
        let nodes: Vec<RegionNode> = node_stats
            .into_iter()
            .map(|(label, stats)| {
                RegionNode::new(
                    NodeId(label),
                    stats.size,
                    stats.touches_border,
                    stats.features,
                )
            })
            .collect();

        let mut edge_stats: Vec<((u32, u32), EdgeStats)> = partial.edges.into_iter().collect();
        edge_stats.sort_unstable_by_key(|(key, _)| *key);
        let edges: Vec<RegionEdge> = edge_stats
            .into_iter()
            .enumerate()
            .map(|(idx, ((a, b), stats))| {
                RegionEdge::new(
                    EdgeId(idx),
                    NodeId(a),
                    NodeId(b),
                    stats.boundary,
                    stats.features,
                    stats.location_sum,
                )
            })
            .collect();

        let (pw, ph, pd) = padded_labels.dims();
        let slice_len = padded_labels.slice_len();
        let mut slots = Buffer3::new_filled(pw, ph, pd, BACKGROUND_SLOT);
        slots
            .voxels_mut()
            .par_slices_mut_auto(slice_len)
            .for_each(|(first_slice, chunk)| {
                let base = first_slice * slice_len;
                for (offset, slot) in chunk.iter_mut().enumerate() {
                    let label = padded_labels[base + offset];
                    if label != 0 {
                        *slot = slot_by_label[&label];
                    }
                }
            });

        Ok(RegionGraph::from_parts(labels.dims(), slots, nodes, edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureKind;

    fn labels_2x2() -> Buffer3<u32> {
        // 4x4x1, quadrants 1 2 / 3 4
        #[rustfmt::skip]
        let data = vec![
            1, 1, 2, 2,
            1, 1, 2, 2,
            3, 3, 4, 4,
            3, 3, 4, 4,
        ];
        Buffer3::new(4, 4, 1, data)
    }

    #[test]
    fn quadrants_produce_four_nodes_and_four_edges() -> anyhow::Result<()> {
        let labels = labels_2x2();
        let probs = Buffer3::new_filled(4, 4, 1, 0.25);
        let fmgr = FeatureManager::mean_boundary(1)?;
        let graph = RegionGraph::build(&labels, &[probs], &fmgr, BuildMode::Sequential)?;

        assert_eq!(graph.number_of_nodes(), 4);
        assert_eq!(graph.live_edges().count(), 4);
        assert_eq!(graph.total_size(), 16);
        for node in graph.active_nodes() {
            assert_eq!(node.size(), 4);
            assert!(node.touches_border());
        }

        let edge = graph.edge(graph.edge_between(NodeId(1), NodeId(2)).unwrap());
        assert_eq!(edge.boundary_size(), 2);
        assert_eq!(edge.features().count(), 4);
        assert!(graph.edge_between(NodeId(1), NodeId(4)).is_none());
        graph.validate()?;
        Ok(())
    }

    #[test]
    fn background_is_excluded() -> anyhow::Result<()> {
        let labels = Buffer3::new(3, 1, 1, vec![5, 0, 6]);
        let probs = Buffer3::new_filled(3, 1, 1, 0.5);
        let fmgr = FeatureManager::mean_boundary(1)?;
        let graph = RegionGraph::build(&labels, &[probs], &fmgr, BuildMode::Sequential)?;

        assert_eq!(graph.number_of_nodes(), 2);
        assert_eq!(graph.live_edges().count(), 0);
        assert_eq!(graph.voxel_count(), 2);
        assert_eq!(graph.locate(1, 0, 0)?, None);
        assert_eq!(graph.locate(2, 0, 0)?, Some(NodeId(6)));
        assert!(graph.locate(3, 0, 0).is_err());
        Ok(())
    }

    #[test]
    fn parallel_build_matches_sequential() -> anyhow::Result<()> {
        let (w, h, d) = (6, 5, 9);
        let labels = Buffer3::new(
            w,
            h,
            d,
            (0..w * h * d)
                .map(|i| {
                    let (x, _, z) = (i % w, (i / w) % h, i / (w * h));
                    (x / 2 + 3 * (z / 3)) as u32 + 1
                })
                .collect(),
        );
        let probs = Buffer3::new(
            w,
            h,
            d,
            (0..w * h * d).map(|i| (i % 7) as f64 / 7.0).collect(),
        );
        let fmgr = FeatureManager::new(
            1,
            vec![FeatureKind::Histogram {
                nbins: 4,
                compute_percentiles: false,
            }],
            None,
        )?;

        let seq = RegionGraph::build(&labels, &[probs.clone()], &fmgr, BuildMode::Sequential)?;
        let par = RegionGraph::build(&labels, &[probs], &fmgr, BuildMode::Parallel)?;

        assert_eq!(seq.number_of_nodes(), par.number_of_nodes());
        let seq_edges: Vec<_> = seq
            .live_edges()
            .map(|e| (e.endpoints(), e.boundary_size(), e.location_sum))
            .collect();
        let par_edges: Vec<_> = par
            .live_edges()
            .map(|e| (e.endpoints(), e.boundary_size(), e.location_sum))
            .collect();
        assert_eq!(seq_edges, par_edges);
        for (a, b) in seq.active_nodes().zip(par.active_nodes()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.size(), b.size());
            assert_eq!(a.features().accumulators(), b.features().accumulators());
        }
        Ok(())
    }

    #[test]
    fn channel_mismatches_are_rejected() -> anyhow::Result<()> {
        let labels = labels_2x2();
        let fmgr = FeatureManager::mean_boundary(2)?;

        let one = vec![Buffer3::new_filled(4, 4, 1, 0.0)];
        assert!(matches!(
            RegionGraph::build(&labels, &one, &fmgr, BuildMode::Sequential),
            Err(RagError::ChannelCountMismatch {
                expected: 2,
                actual: 1
            })
        ));

        let wrong = vec![
            Buffer3::new_filled(4, 4, 1, 0.0),
            Buffer3::new_filled(4, 2, 2, 0.0),
        ];
        assert!(matches!(
            RegionGraph::build(&labels, &wrong, &fmgr, BuildMode::Sequential),
            Err(RagError::ChannelShapeMismatch { channel: 1, .. })
        ));
        Ok(())
    }
}
