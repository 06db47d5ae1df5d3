//! Materializes an agglomerated graph: relabeled volume and JSON summary.

use std::path::Path;

use common::parallel::ParSlicesMutAuto;
use common::Buffer3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};
use crate::events::{EventSink, RagEvent};
use crate::exclusion::ExclusionSet;
use crate::features::FeatureManager;
use crate::region_graph::{NodeId, Point3, RegionGraph, BACKGROUND_SLOT};

/// Relabeled, unpadded segmentation; background stays 0.
pub fn labels(graph: &RegionGraph) -> Buffer3<u32> {
    let (w, h, d) = graph.dims();
    let mut out = Buffer3::new_filled(w, h, d, 0u32);
    fill_labels(graph, &mut out);
    out
}

/// Writes the relabeled segmentation into a caller-owned volume of the input shape.
pub fn write_labels(graph: &RegionGraph, out: &mut Buffer3<u32>) -> RagResult<()> {
    if out.dims() != graph.dims() {
        return Err(RagError::VolumeShapeMismatch {
            expected: graph.dims(),
            actual: out.dims(),
        });
    }
    fill_labels(graph, out);
    Ok(())
}

fn fill_labels(graph: &RegionGraph, out: &mut Buffer3<u32>) {
    if out.is_empty() {
        return;
    }

    let resolved = graph.resolved_ids();
    let (w, h, _) = out.dims();
    let slice_len = out.slice_len();
    let slots = &graph.slots;

    out.voxels_mut()
        .par_slices_mut_auto(slice_len)
        .for_each(|(first_slice, chunk)| {
            for (offset, voxel) in chunk.iter_mut().enumerate() {
                let idx = first_slice * slice_len + offset;
                let x = idx % w;
                let y = (idx / w) % h;
                let z = idx / slice_len;
                let slot = *slots.get(x + 1, y + 1, z + 1);
                *voxel = if slot == BACKGROUND_SLOT {
                    0
                } else {
                    resolved[slot as usize]
                };
            }
        });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub node1: NodeId,
    pub node2: NodeId,
    pub size1: u64,
    pub size2: u64,
    pub preserve: bool,
    pub false_edge: bool,
    pub weight: f64,
    pub location: Point3,
}

/// Residual graph as written next to the segmentation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    /// `[node_id, annotation_count]` pairs; absent when no annotations were loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synapse_bodies: Option<Vec<(NodeId, usize)>>,
    pub orphan_bodies: Vec<NodeId>,
    pub edge_list: Vec<EdgeRecord>,
}

impl GraphSummary {
    pub fn to_json(&self) -> RagResult<String> {
        Ok(common::to_json_indented(self)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> RagResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Summarizes the current graph.
///
/// Locates every surviving edge first. False edges report weight 1.0 and a
/// zero location; other edges report their cached score, or a fresh one when
/// the engine never scored them.
pub fn summarize(
    graph: &mut RegionGraph,
    fmgr: &FeatureManager,
    exclusions: Option<&ExclusionSet>,
    sink: &dyn EventSink,
) -> GraphSummary {
    let synapse_bodies = exclusions.map(|set| set.body_counts(graph));

    let orphan_bodies: Vec<NodeId> = graph
        .active_nodes()
        .map(|node| node.id())
        .filter(|&id| graph.is_orphan(id))
        .collect();

    let located = graph.determine_edge_locations();
    sink.record(&RagEvent::EdgeLocationsDetermined { edges: located });

    let graph: &RegionGraph = graph;
    let size = |id: NodeId| graph.node(id).map(|node| node.size()).unwrap_or(0);
    let mut edge_list: Vec<EdgeRecord> = graph
        .live_edges()
        .map(|edge| {
            let (node1, node2) = edge.endpoints();
            let (weight, location) = if edge.is_false_edge() {
                (1.0, [0, 0, 0])
            } else {
                let weight = edge
                    .weight()
                    .unwrap_or_else(|| fmgr.merge_probability(graph, edge.id()));
                (weight, edge.location().unwrap_or([0, 0, 0]))
            };

            EdgeRecord {
                node1,
                node2,
                size1: size(node1),
                size2: size(node2),
                preserve: edge.is_preserve(),
                false_edge: edge.is_false_edge(),
                weight,
                location,
            }
        })
        .collect();
    edge_list.sort_unstable_by_key(|record| (record.node1, record.node2));

    GraphSummary {
        synapse_bodies,
        orphan_bodies,
        edge_list,
    }
}
