//! Do-not-merge constraints derived from synapse annotations.

use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};
use crate::events::{EventSink, RagEvent};
use crate::region_graph::{NodeId, Point3, RegionGraph};

/// `{"data": [{"T-bar": {"location": [x, y, z]}, "partners": [...]}]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationFile {
    pub data: Vec<AnnotationItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationItem {
    #[serde(rename = "T-bar")]
    pub marker: AnnotationPoint,
    #[serde(default)]
    pub partners: Vec<AnnotationPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPoint {
    pub location: Point3,
}

impl AnnotationItem {
    pub fn new(marker: Point3, partners: impl IntoIterator<Item = Point3>) -> Self {
        Self {
            marker: AnnotationPoint { location: marker },
            partners: partners
                .into_iter()
                .map(|location| AnnotationPoint { location })
                .collect(),
        }
    }

    /// Marker first, then partners in file order.
    pub fn points(&self) -> Vec<Point3> {
        std::iter::once(self.marker.location)
            .chain(self.partners.iter().map(|partner| partner.location))
            .collect()
    }
}

impl AnnotationFile {
    pub fn from_json_str(text: &str) -> RagResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> RagResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Two points of one group that resolved to the same region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub node: NodeId,
    pub first: Point3,
    pub second: Point3,
}

/// Registered annotation points plus the outcome of turning them into constraints.
///
/// The constraints themselves live on the graph nodes, so they follow merges.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    points: Vec<Point3>,
    added: usize,
    conflicts: Vec<Conflict>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrains every pair of points in the group that lands in different regions.
    ///
    /// Pairs that share a region are reported as conflicts and the rest of the
    /// group is still processed. Points outside the volume or on background are
    /// skipped. Returns the number of new constraints.
    pub fn register_group(
        &mut self,
        graph: &mut RegionGraph,
        points: &[Point3],
        sink: &dyn EventSink,
    ) -> RagResult<usize> {
        let mut resolved: Vec<(Point3, NodeId)> = Vec::with_capacity(points.len());
        for &point in points {
            let [x, y, z] = point;
            match graph.locate(x, y, z) {
                Ok(Some(node)) => {
                    self.points.push(point);
                    resolved.push((point, node));
                }
                Ok(None) => sink.record(&RagEvent::AnnotationSkipped {
                    point,
                    reason: "background voxel",
                }),
                Err(RagError::OutOfBounds { .. }) => sink.record(&RagEvent::AnnotationSkipped {
                    point,
                    reason: "outside volume",
                }),
                Err(err) => return Err(err),
            }
        }

        let mut added = 0;
        for (i, &(first, a)) in resolved.iter().enumerate() {
            for &(second, b) in resolved[i + 1..].iter() {
                if a == b {
                    self.conflicts.push(Conflict {
                        node: a,
                        first,
                        second,
                    });
                    sink.record(&RagEvent::ConstraintConflict {
                        node: a,
                        first,
                        second,
                    });
                    continue;
                }

                if graph.add_constraint(a, b)? {
                    added += 1;
                    sink.record(&RagEvent::ConstraintAdded { a, b });
                }
            }
        }

        self.added += added;
        Ok(added)
    }

    pub fn register_file(
        &mut self,
        graph: &mut RegionGraph,
        file: &AnnotationFile,
        sink: &dyn EventSink,
    ) -> RagResult<usize> {
        let mut added = 0;
        for item in file.data.iter() {
            added += self.register_group(graph, &item.points(), sink)?;
        }
        Ok(added)
    }

    /// Every accepted annotation point, in registration order.
    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn constraints_added(&self) -> usize {
        self.added
    }

    /// Annotation points per region the points currently resolve to, ordered by id.
    pub fn body_counts(&self, graph: &RegionGraph) -> Vec<(NodeId, usize)> {
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for &[x, y, z] in self.points.iter() {
            if let Ok(Some(node)) = graph.locate(x, y, z) {
                *counts.entry(node).or_default() += 1;
            }
        }

        let mut counts: Vec<(NodeId, usize)> = counts.into_iter().collect();
        counts.sort_unstable();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_annotation_layout() -> anyhow::Result<()> {
        let file = AnnotationFile::from_json_str(
            r#"{"data": [
                {"T-bar": {"location": [1, 2, 0], "confidence": 0.9},
                 "partners": [{"location": [3, 2, 0]}, {"location": [0, 0, 0]}]},
                {"T-bar": {"location": [0, 1, 0]}}
            ]}"#,
        )?;

        assert_eq!(file.data.len(), 2);
        assert_eq!(file.data[0].points(), vec![[1, 2, 0], [3, 2, 0], [0, 0, 0]]);
        assert_eq!(file.data[1].points(), vec![[0, 1, 0]]);
        assert_eq!(file.data[1], AnnotationItem::new([0, 1, 0], []));
        Ok(())
    }

    #[test]
    fn missing_data_fails() {
        assert!(matches!(
            AnnotationFile::from_json_str(r#"{"items": []}"#),
            Err(RagError::Json(_))
        ));
    }
}
