//! Priority-driven agglomeration over a [`RegionGraph`].
//!
//! Edges are popped lowest boundary probability first. Every merge re-scores the
//! edges now incident to the survivor and re-inserts them with a fresh stamp, so
//! an entry whose stamp no longer matches its edge is stale and gets dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::Serialize;
use tracing::debug;

use crate::config::{AgglomerationConfig, FalseEdgePolicy, SurvivorRule};
use crate::error::{RagError, RagResult};
use crate::events::{EventSink, RagEvent};
use crate::features::FeatureManager;
use crate::region_graph::{EdgeId, NodeId, RegionEdge, RegionGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeReason {
    /// The cheapest remaining edge is at or above the threshold.
    #[strum(to_string = "threshold reached")]
    ThresholdReached,
    #[strum(to_string = "no candidate edges left")]
    QueueExhausted,
    #[strum(to_string = "merge budget exhausted")]
    BudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Ready,
    Merging,
    Converged(ConvergeReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgglomerationStats {
    pub merges: usize,
    pub scored: usize,
    pub stale_dropped: usize,
    pub constrained_skipped: usize,
    pub inclusions_removed: usize,
    pub reason: Option<ConvergeReason>,
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    score: f64,
    key: (NodeId, NodeId),
    edge: EdgeId,
    stamp: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // reversed: BinaryHeap is a max-heap, lowest score (then lowest endpoint pair) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.key.cmp(&self.key))
            .then_with(|| other.stamp.cmp(&self.stamp))
    }
}

/// Owns the graph exclusively for the duration of a run.
pub struct AgglomerationEngine<'a> {
    graph: &'a mut RegionGraph,
    fmgr: &'a FeatureManager,
    sink: &'a dyn EventSink,
    config: AgglomerationConfig,
    queue: BinaryHeap<QueueEntry>,
    state: EngineState,
    stats: AgglomerationStats,
}

impl<'a> AgglomerationEngine<'a> {
    /// Fails on a non-finite threshold, or when `fmgr` has different channels or
    /// feature kinds than the manager the graph was built with.
    pub fn new(
        graph: &'a mut RegionGraph,
        fmgr: &'a FeatureManager,
        sink: &'a dyn EventSink,
        config: AgglomerationConfig,
    ) -> RagResult<Self> {
        config.validate()?;
        let layout_matches = graph
            .active_nodes()
            .next()
            .map_or(true, |node| fmgr.matches(node.features()));
        if !layout_matches {
            return Err(RagError::FeatureLayoutMismatch);
        }

        Ok(Self {
            graph,
            fmgr,
            sink,
            config,
            queue: BinaryHeap::new(),
            state: EngineState::Ready,
            stats: AgglomerationStats::default(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> AgglomerationStats {
        self.stats
    }

    pub fn graph(&self) -> &RegionGraph {
        &*self.graph
    }

    fn is_candidate(&self, edge: &RegionEdge) -> bool {
        if !edge.is_alive() || edge.is_preserve() {
            return false;
        }
        !edge.is_false_edge() || self.config.false_edge_policy == FalseEdgePolicy::MergeFirst
    }

    fn score(&mut self, edge: EdgeId) -> f64 {
        let score = if self.graph.edge(edge).is_false_edge() {
            0.0
        } else {
            self.fmgr.merge_probability(&*self.graph, edge)
        };
        self.graph.cache_weight(edge, score);
        self.stats.scored += 1;
        score
    }

    fn schedule(&mut self, edge: EdgeId) {
        if !self.is_candidate(self.graph.edge(edge)) {
            return;
        }

        let score = self.score(edge);
        let e = self.graph.edge_mut(edge);
        e.stamp += 1;
        self.queue.push(QueueEntry {
            score,
            key: e.endpoints(),
            edge,
            stamp: e.stamp,
        });
    }

    fn seed(&mut self) {
        let edges: Vec<EdgeId> = self.graph.live_edges().map(RegionEdge::id).collect();
        for edge in edges {
            self.schedule(edge);
        }
        debug!(candidates = self.queue.len(), "Agglomeration queue seeded");
    }

    fn pick_survivor(&self, a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        match self.config.survivor {
            SurvivorRule::LowerId => (a.min(b), a.max(b)),
            SurvivorRule::Larger => {
                let size = |id| self.graph.node(id).map(|node| node.size()).unwrap_or(0);
                let (sa, sb) = (size(a), size(b));
                if sa > sb || (sa == sb && a < b) {
                    (a, b)
                } else {
                    (b, a)
                }
            }
        }
    }

    fn converge(&mut self, reason: ConvergeReason) -> AgglomerationStats {
        self.queue.clear();
        self.state = EngineState::Converged(reason);
        self.stats.reason = Some(reason);
        self.sink.record(&RagEvent::Converged {
            merges: self.stats.merges,
            reason,
        });
        self.stats
    }

    /// Merges until the cheapest candidate edge is not below the threshold.
    ///
    /// A second call on a converged engine returns the same stats.
    pub fn run(&mut self) -> RagResult<AgglomerationStats> {
        match self.state {
            EngineState::Converged(_) => return Ok(self.stats),
            EngineState::Ready => {
                self.seed();
                self.state = EngineState::Merging;
            }
            EngineState::Merging => {}
        }

        loop {
            if let Some(max) = self.config.max_merges {
                if self.stats.merges >= max {
                    return Ok(self.converge(ConvergeReason::BudgetExhausted));
                }
            }

            let Some(entry) = self.queue.pop() else {
                return Ok(self.converge(ConvergeReason::QueueExhausted));
            };

            let edge = self.graph.edge(entry.edge);
            if !edge.is_alive() || edge.stamp != entry.stamp {
                self.stats.stale_dropped += 1;
                continue;
            }
            if !self.is_candidate(edge) {
                continue;
            }

            let (a, b) = edge.endpoints();
            if self.graph.is_constrained(a, b) {
                self.stats.constrained_skipped += 1;
                continue;
            }

            if entry.score.partial_cmp(&self.config.threshold) != Some(Ordering::Less) {
                return Ok(self.converge(ConvergeReason::ThresholdReached));
            }

            let (survivor, absorbed) = self.pick_survivor(a, b);
            self.graph.merge(survivor, absorbed)?;
            self.stats.merges += 1;
            self.sink.record(&RagEvent::Merged {
                survivor,
                absorbed,
                score: entry.score,
            });

            let incident: Vec<EdgeId> = self
                .graph
                .node(survivor)
                .map(|node| node.neighbors().map(|(_, edge)| edge).collect())
                .unwrap_or_default();
            for edge in incident {
                self.schedule(edge);
            }
        }
    }

    /// Absorbs every region enclosed by a single neighbor into that neighbor.
    ///
    /// A region qualifies when it has exactly one live edge, does not touch the
    /// volume border, and the edge is neither preserved nor constrained.
    pub fn remove_inclusions(&mut self) -> RagResult<usize> {
        let mut worklist: Vec<NodeId> = self.graph.active_nodes().map(|node| node.id()).collect();
        worklist.sort_unstable_by(|a, b| b.cmp(a));
        let mut removed = 0;

        while let Some(id) = worklist.pop() {
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            if !node.is_active() || node.touches_border() || node.degree() != 1 {
                continue;
            }
            let Some((enclosing, edge)) = node.neighbors().next() else {
                continue;
            };
            if self.graph.edge(edge).is_preserve() || self.graph.is_constrained(id, enclosing) {
                continue;
            }

            self.graph.merge(enclosing, id)?;
            removed += 1;
            self.sink.record(&RagEvent::InclusionRemoved {
                survivor: enclosing,
                absorbed: id,
            });
            worklist.push(enclosing);
        }

        self.stats.inclusions_removed += removed;
        Ok(removed)
    }
}
