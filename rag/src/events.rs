//! Structured event sink the engine reports through instead of logging ad hoc.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::agglomerate::ConvergeReason;
use crate::region_graph::{NodeId, Point3};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RagEvent {
    GraphBuilt {
        nodes: usize,
        edges: usize,
        voxels: u64,
    },
    ConstraintAdded {
        a: NodeId,
        b: NodeId,
    },
    /// Two points of one annotation group landed in the same region.
    ConstraintConflict {
        node: NodeId,
        first: Point3,
        second: Point3,
    },
    AnnotationSkipped {
        point: Point3,
        reason: &'static str,
    },
    Merged {
        survivor: NodeId,
        absorbed: NodeId,
        score: f64,
    },
    InclusionRemoved {
        survivor: NodeId,
        absorbed: NodeId,
    },
    Converged {
        merges: usize,
        reason: ConvergeReason,
    },
    EdgeLocationsDetermined {
        edges: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &RagEvent);
}

/// Forwards every event to `tracing` at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &RagEvent) {
        match event {
            RagEvent::GraphBuilt {
                nodes,
                edges,
                voxels,
            } => info!(nodes, edges, voxels, "Region adjacency graph built"),
            RagEvent::ConstraintAdded { a, b } => debug!(%a, %b, "Exclusion constraint added"),
            RagEvent::ConstraintConflict {
                node,
                first,
                second,
            } => error!(
                %node,
                ?first,
                ?second,
                "Tbar/PSD lie in same superpixel"
            ),
            RagEvent::AnnotationSkipped { point, reason } => {
                warn!(?point, reason, "Annotation point skipped")
            }
            RagEvent::Merged {
                survivor,
                absorbed,
                score,
            } => debug!(%survivor, %absorbed, score, "Regions merged"),
            RagEvent::InclusionRemoved { survivor, absorbed } => {
                debug!(%survivor, %absorbed, "Inclusion removed")
            }
            RagEvent::Converged { merges, reason } => {
                info!(merges, %reason, "Agglomeration converged")
            }
            RagEvent::EdgeLocationsDetermined { edges } => {
                info!(edges, "Finished determining optimal edge locations")
            }
        }
    }
}

/// Keeps every event in memory; handy when a caller wants the structured record.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RagEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RagEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<RagEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn conflicts(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, RagEvent::ConstraintConflict { .. }))
            .count()
    }
}

impl EventSink for CollectingSink {
    fn record(&self, event: &RagEvent) {
        self.events.lock().push(event.clone());
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn record(&self, event: &RagEvent) {
        (**self).record(event)
    }
}
