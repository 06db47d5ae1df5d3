use std::fmt;

use common::{is_debug, Buffer3};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::error::{MergeRejection, RagError, RagResult};
use crate::features::{EdgeContext, FeatureSet};

/// Voxel coordinate `[x, y, z]` in the unpadded volume.
pub type Point3 = [usize; 3];

/// Slot value marking background voxels in the slot volume.
pub(crate) const BACKGROUND_SLOT: u32 = u32::MAX;

/// Region identifier: the watershed label the region was built from.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct EdgeId(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct RegionNode {
    id: NodeId,
    size: u64,
    active: bool,
    touches_border: bool,
    pub(crate) features: FeatureSet,
    neighbors: HashMap<NodeId, EdgeId>,
    exclusions: HashSet<NodeId>,
}

impl RegionNode {
    pub(crate) fn new(id: NodeId, size: u64, touches_border: bool, features: FeatureSet) -> Self {
        Self {
            id,
            size,
            active: true,
            touches_border,
            features,
            neighbors: HashMap::new(),
            exclusions: HashSet::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn is_active(&self) -> bool {
        self.active
    }
    pub fn touches_border(&self) -> bool {
        self.touches_border
    }
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }
    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }
    pub fn neighbors(&self) -> impl Iterator<Item = (NodeId, EdgeId)> + '_ {
        self.neighbors.iter().map(|(&n, &e)| (n, e))
    }
    pub fn exclusions(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.exclusions.iter().copied()
    }
}

#[derive(Debug, Clone)]
pub struct RegionEdge {
    id: EdgeId,
    node1: NodeId,
    node2: NodeId,
    boundary_size: u64,
    pub(crate) features: FeatureSet,
    pub(crate) location_sum: [u64; 3],
    location: Option<Point3>,
    weight: Option<f64>,
    preserve: bool,
    false_edge: bool,
    alive: bool,
    pub(crate) stamp: u64,
}

impl RegionEdge {
    pub(crate) fn new(
        id: EdgeId,
        a: NodeId,
        b: NodeId,
        boundary_size: u64,
        features: FeatureSet,
        location_sum: [u64; 3],
    ) -> Self {
        assert_ne!(a, b, "Self loop on {a}");
        Self {
            id,
            node1: a.min(b),
            node2: a.max(b),
            boundary_size,
            features,
            location_sum,
            location: None,
            weight: None,
            preserve: false,
            false_edge: false,
            alive: true,
            stamp: 0,
        }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }
    pub fn node1(&self) -> NodeId {
        self.node1
    }
    pub fn node2(&self) -> NodeId {
        self.node2
    }
    pub fn endpoints(&self) -> (NodeId, NodeId) {
        (self.node1, self.node2)
    }
    pub fn boundary_size(&self) -> u64 {
        self.boundary_size
    }
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }
    pub fn is_preserve(&self) -> bool {
        self.preserve
    }
    pub fn is_false_edge(&self) -> bool {
        self.false_edge
    }
    pub fn is_alive(&self) -> bool {
        self.alive
    }
    /// Last score cached by the agglomeration engine.
    pub fn weight(&self) -> Option<f64> {
        self.weight
    }
    /// Boundary voxel picked by [`RegionGraph::determine_edge_locations`].
    pub fn location(&self) -> Option<Point3> {
        self.location
    }

    /// Mean position of the boundary faces.
    pub fn centroid(&self) -> Option<[f64; 3]> {
        if self.boundary_size == 0 {
            return None;
        }
        let n = self.boundary_size as f64;
        Some(self.location_sum.map(|s| s as f64 / n))
    }

    pub fn other(&self, node: NodeId) -> NodeId {
        if node == self.node1 {
            self.node2
        } else {
            assert_eq!(node, self.node2, "{node} is not an endpoint of {:?}", self.id);
            self.node1
        }
    }

    fn replace_endpoint(&mut self, from: NodeId, to: NodeId) {
        let other = self.other(from);
        assert_ne!(other, to, "Re-keying would create a self loop on {to}");
        self.node1 = other.min(to);
        self.node2 = other.max(to);
    }

    fn absorb(&mut self, other: &mut RegionEdge) {
        self.boundary_size += other.boundary_size;
        self.features.combine(&std::mem::take(&mut other.features));
        for (a, b) in self.location_sum.iter_mut().zip(other.location_sum) {
            *a += b;
        }
        self.preserve |= other.preserve;
        self.false_edge &= other.false_edge;
        self.weight = None;
        self.location = None;
        other.alive = false;
    }
}

/// Region adjacency graph over a padded watershed volume.
///
/// Nodes are never removed: an absorbed node is marked inactive and its slot
/// joins the survivor's set in a union-find over node slots, so every voxel
/// keeps resolving to a live region.
///
/// The union-find stays flat: `parent` maps each slot straight to its set
/// representative and `owner` maps a representative to the live node slot.
/// A merge re-points the members of the smaller set, so lookups are two
/// array reads and merges cost O(smaller set).
#[derive(Debug)]
pub struct RegionGraph {
    dims: (usize, usize, usize),
    pub(crate) slots: Buffer3<u32>,
    slot_by_id: HashMap<NodeId, usize>,
    pub(crate) nodes: Vec<RegionNode>,
    parent: Vec<usize>,
    members: Vec<Vec<usize>>,
    owner: Vec<usize>,
    pub(crate) edges: Vec<RegionEdge>,
    voxel_count: u64,
}

impl RegionGraph {
    pub(crate) fn from_parts(
        dims: (usize, usize, usize),
        slots: Buffer3<u32>,
        nodes: Vec<RegionNode>,
        edges: Vec<RegionEdge>,
    ) -> Self {
        let slot_by_id: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(slot, node)| (node.id, slot))
            .collect();
        assert_eq!(slot_by_id.len(), nodes.len(), "Duplicate node id");

        let voxel_count = nodes.iter().map(|node| node.size).sum();
        let parent = (0..nodes.len()).collect();
        let members = (0..nodes.len()).map(|slot| vec![slot]).collect();
        let owner = (0..nodes.len()).collect();

        let mut graph = Self {
            dims,
            slots,
            slot_by_id,
            nodes,
            parent,
            members,
            owner,
            edges: Vec::new(),
            voxel_count,
        };
        for edge in edges {
            graph.insert_edge(edge);
        }

        graph
    }

    fn insert_edge(&mut self, edge: RegionEdge) {
        let (a, b) = edge.endpoints();
        let id = edge.id;
        assert_eq!(id.0, self.edges.len());

        let slot_a = self.slot_by_id[&a];
        let slot_b = self.slot_by_id[&b];
        let prev_a = self.nodes[slot_a].neighbors.insert(b, id);
        let prev_b = self.nodes[slot_b].neighbors.insert(a, id);
        assert!(prev_a.is_none() && prev_b.is_none(), "Duplicate edge {a}-{b}");

        self.edges.push(edge);
    }

    /// Unpadded `(width, height, depth)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn voxel_count(&self) -> u64 {
        self.voxel_count
    }

    pub fn number_of_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.active).count()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &RegionNode> + '_ {
        self.nodes.iter().filter(|node| node.active)
    }

    pub fn live_edges(&self) -> impl Iterator<Item = &RegionEdge> + '_ {
        self.edges.iter().filter(|edge| edge.alive)
    }

    pub fn total_size(&self) -> u64 {
        self.active_nodes().map(|node| node.size).sum()
    }

    pub fn node(&self, id: NodeId) -> Option<&RegionNode> {
        self.slot_by_id.get(&id).map(|&slot| &self.nodes[slot])
    }

    pub fn edge(&self, id: EdgeId) -> &RegionEdge {
        &self.edges[id.0]
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> &mut RegionEdge {
        &mut self.edges[id.0]
    }

    pub fn edge_between(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        self.node(a)?.neighbors.get(&b).copied()
    }

    fn slot_of(&self, id: NodeId) -> RagResult<usize> {
        let slot = *self.slot_by_id.get(&id).ok_or(RagError::UnknownNode(id))?;
        Ok(slot)
    }

    fn find_root(&self, slot: usize) -> usize {
        self.owner[self.parent[slot]]
    }

    /// Joins the set holding `slot_b` into the set of `slot_a`; `slot_a` owns the result.
    fn union(&mut self, slot_a: usize, slot_b: usize) {
        let rep_a = self.parent[slot_a];
        let rep_b = self.parent[slot_b];
        if rep_a == rep_b {
            return;
        }

        let (keep, gone) = if self.members[rep_a].len() >= self.members[rep_b].len() {
            (rep_a, rep_b)
        } else {
            (rep_b, rep_a)
        };
        let moved = std::mem::take(&mut self.members[gone]);
        for &slot in moved.iter() {
            self.parent[slot] = keep;
        }
        self.members[keep].extend(moved);
        self.owner[keep] = slot_a;
    }

    /// Every slot one hop from its representative, and every representative owned by a live node.
    #[cfg(test)]
    pub(crate) fn union_find_is_flat(&self) -> bool {
        self.parent.iter().all(|&rep| {
            self.parent[rep] == rep
                && self.members[rep].contains(&rep)
                && self.nodes[self.owner[rep]].active
        })
    }

    /// Current active node a region built from label `id` resolves to.
    pub fn resolve(&self, id: NodeId) -> Option<NodeId> {
        let slot = *self.slot_by_id.get(&id)?;
        Some(self.nodes[self.find_root(slot)].id)
    }

    /// Resolves an unpadded voxel coordinate to its live region; `None` on background.
    pub fn locate(&self, x: usize, y: usize, z: usize) -> RagResult<Option<NodeId>> {
        let (w, h, d) = self.dims;
        if x >= w || y >= h || z >= d {
            return Err(RagError::OutOfBounds { x, y, z });
        }

        let slot = *self.slots.get(x + 1, y + 1, z + 1);
        if slot == BACKGROUND_SLOT {
            return Ok(None);
        }

        Ok(Some(self.nodes[self.find_root(slot as usize)].id))
    }

    /// Id each slot currently resolves to, indexed by slot.
    pub(crate) fn resolved_ids(&self) -> Vec<u32> {
        (0..self.nodes.len())
            .map(|slot| self.nodes[self.find_root(slot)].id.0)
            .collect()
    }

    pub fn is_constrained(&self, a: NodeId, b: NodeId) -> bool {
        self.node(a)
            .map(|node| node.exclusions.contains(&b))
            .unwrap_or(false)
    }

    /// Forbids `a` and `b` from ever merging. Returns `false` when already present.
    pub fn add_constraint(&mut self, a: NodeId, b: NodeId) -> RagResult<bool> {
        let slot_a = self.slot_of(a)?;
        let slot_b = self.slot_of(b)?;
        let reject = |reason| RagError::InvalidMergeAttempt { a, b, reason };
        if a == b {
            return Err(reject(MergeRejection::SameNode));
        }
        if !self.nodes[slot_a].active || !self.nodes[slot_b].active {
            return Err(reject(MergeRejection::Inactive));
        }

        let inserted = self.nodes[slot_a].exclusions.insert(b);
        self.nodes[slot_b].exclusions.insert(a);
        Ok(inserted)
    }

    pub fn set_preserve(&mut self, a: NodeId, b: NodeId, preserve: bool) -> RagResult<()> {
        let edge = self.edge_between(a, b).ok_or(RagError::UnknownEdge(a, b))?;
        self.edges[edge.0].preserve = preserve;
        Ok(())
    }

    pub fn set_false_edge(&mut self, a: NodeId, b: NodeId, false_edge: bool) -> RagResult<()> {
        let edge = self.edge_between(a, b).ok_or(RagError::UnknownEdge(a, b))?;
        self.edges[edge.0].false_edge = false_edge;
        Ok(())
    }

    fn two_edges_mut(&mut self, a: EdgeId, b: EdgeId) -> (&mut RegionEdge, &mut RegionEdge) {
        assert_ne!(a, b);
        if a.0 < b.0 {
            let (left, right) = self.edges.split_at_mut(b.0);
            (&mut left[a.0], &mut right[0])
        } else {
            let (left, right) = self.edges.split_at_mut(a.0);
            (&mut right[0], &mut left[b.0])
        }
    }

    pub(crate) fn cache_weight(&mut self, edge: EdgeId, weight: f64) {
        self.edges[edge.0].weight = Some(weight);
    }

    /// Orphan: no live edges other than false edges and no voxel on the volume border.
    pub fn is_orphan(&self, id: NodeId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        if !node.active || node.touches_border {
            return false;
        }
        node.neighbors
            .values()
            .all(|&edge| self.edges[edge.0].false_edge)
    }

    /// Sum of boundary sizes over the node's live edges.
    pub fn boundary_total(&self, id: NodeId) -> u64 {
        self.node(id)
            .map(|node| {
                node.neighbors
                    .values()
                    .map(|&edge| self.edges[edge.0].boundary_size)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn edge_context(&self, edge: EdgeId) -> EdgeContext<'_> {
        let e = &self.edges[edge.0];
        assert!(e.alive, "Scoring dead edge {:?}", edge);

        let n1 = &self.nodes[self.slot_by_id[&e.node1]];
        let n2 = &self.nodes[self.slot_by_id[&e.node2]];
        let (small, large) = if (n1.size, n1.id) <= (n2.size, n2.id) {
            (n1, n2)
        } else {
            (n2, n1)
        };

        EdgeContext {
            edge: &e.features,
            small: &small.features,
            large: &large.features,
            edge_boundary: e.boundary_size,
            small_boundary: self.boundary_total(small.id),
            large_boundary: self.boundary_total(large.id),
        }
    }

    /// Absorbs `absorbed` into `survivor` and returns the survivor.
    ///
    /// Edges of the absorbed node are re-keyed onto the survivor; when the survivor
    /// already borders the same neighbor the two edges are combined into one.
    /// Constraints on the absorbed node carry over to the survivor.
    pub fn merge(&mut self, survivor: NodeId, absorbed: NodeId) -> RagResult<NodeId> {
        let slot_a = self.slot_of(survivor)?;
        let slot_b = self.slot_of(absorbed)?;

        let reject = |reason| RagError::InvalidMergeAttempt {
            a: survivor,
            b: absorbed,
            reason,
        };
        if survivor == absorbed {
            return Err(reject(MergeRejection::SameNode));
        }
        if !self.nodes[slot_a].active || !self.nodes[slot_b].active {
            return Err(reject(MergeRejection::Inactive));
        }
        if self.nodes[slot_a].exclusions.contains(&absorbed) {
            return Err(reject(MergeRejection::Constrained));
        }

        let neighbors = std::mem::take(&mut self.nodes[slot_b].neighbors);
        for (neighbor, edge_b) in neighbors {
            if neighbor == survivor {
                self.nodes[slot_a].neighbors.remove(&absorbed);
                self.edges[edge_b.0].alive = false;
                continue;
            }

            let slot_n = self.slot_by_id[&neighbor];
            self.nodes[slot_n].neighbors.remove(&absorbed);

            match self.nodes[slot_a].neighbors.get(&neighbor).copied() {
                Some(edge_a) => {
                    let (kept, dup) = self.two_edges_mut(edge_a, edge_b);
                    kept.absorb(dup);
                }
                None => {
                    let edge = &mut self.edges[edge_b.0];
                    edge.replace_endpoint(absorbed, survivor);
                    edge.weight = None;
                    self.nodes[slot_a].neighbors.insert(neighbor, edge_b);
                    self.nodes[slot_n].neighbors.insert(survivor, edge_b);
                }
            }
        }

        let exclusions = std::mem::take(&mut self.nodes[slot_b].exclusions);
        for other in exclusions {
            let slot_c = self.slot_by_id[&other];
            self.nodes[slot_c].exclusions.remove(&absorbed);
            self.nodes[slot_c].exclusions.insert(survivor);
            self.nodes[slot_a].exclusions.insert(other);
        }

        let absorbed_features = std::mem::take(&mut self.nodes[slot_b].features);
        let absorbed_size = self.nodes[slot_b].size;
        let absorbed_border = self.nodes[slot_b].touches_border;
        self.nodes[slot_b].active = false;

        let node = &mut self.nodes[slot_a];
        node.size += absorbed_size;
        node.touches_border |= absorbed_border;
        node.features.combine(&absorbed_features);

        self.union(slot_a, slot_b);

        if is_debug() {
            self.debug_check_node(slot_a);
        }

        Ok(survivor)
    }

    fn debug_check_node(&self, slot: usize) {
        let node = &self.nodes[slot];
        for (&neighbor, &edge) in node.neighbors.iter() {
            let e = &self.edges[edge.0];
            assert!(e.alive, "Dead edge {:?} still attached to {}", edge, node.id);
            assert_eq!(e.other(node.id), neighbor);
            let other = &self.nodes[self.slot_by_id[&neighbor]];
            assert!(other.active, "Edge {:?} points at inactive {}", edge, neighbor);
            assert_eq!(other.neighbors.get(&node.id), Some(&edge));
        }
    }

    /// Full structural check: simple graph, live endpoints, symmetric adjacency,
    /// symmetric constraints and conserved voxel count.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for edge in self.live_edges() {
            let (a, b) = edge.endpoints();
            if a == b {
                anyhow::bail!("Self loop on {a}");
            }
            if !seen.insert((a, b)) {
                anyhow::bail!("Duplicate edge {a}-{b}");
            }
            for (n, other) in [(a, b), (b, a)] {
                let node = self
                    .node(n)
                    .ok_or_else(|| anyhow::anyhow!("Edge endpoint {n} is unknown"))?;
                if !node.active {
                    anyhow::bail!("Edge endpoint {n} is inactive");
                }
                if node.neighbors.get(&other) != Some(&edge.id) {
                    anyhow::bail!("Adjacency of {n} does not list edge to {other}");
                }
            }
        }

        let attached: usize = self.active_nodes().map(|node| node.degree()).sum();
        if attached != 2 * seen.len() {
            anyhow::bail!("Adjacency lists reference {attached} edge ends, expected {}", 2 * seen.len());
        }

        for node in self.nodes.iter().filter(|node| !node.active) {
            if !node.neighbors.is_empty() || !node.exclusions.is_empty() {
                anyhow::bail!("Inactive node {} still holds edges or constraints", node.id);
            }
        }
        for node in self.active_nodes() {
            for other in node.exclusions.iter() {
                if !self.is_constrained(*other, node.id) {
                    anyhow::bail!("Constraint {}-{} is not symmetric", node.id, other);
                }
            }
        }

        if self.total_size() != self.voxel_count {
            anyhow::bail!(
                "Active size {} does not match voxel count {}",
                self.total_size(),
                self.voxel_count
            );
        }

        Ok(())
    }

    /// Picks, per live edge, the boundary voxel closest to the boundary centroid.
    pub fn determine_edge_locations(&mut self) -> usize {
        let resolved = self.resolved_ids();
        let mut best: HashMap<EdgeId, (f64, Point3)> = HashMap::new();
        let (w, h, d) = self.dims;

        for z in 1..=d {
            for y in 1..=h {
                for x in 1..=w {
                    let slot = *self.slots.get(x, y, z);
                    if slot == BACKGROUND_SLOT {
                        continue;
                    }
                    let a = NodeId(resolved[slot as usize]);

                    for (nx, ny, nz) in [(x + 1, y, z), (x, y + 1, z), (x, y, z + 1)] {
                        let other = *self.slots.get(nx, ny, nz);
                        if other == BACKGROUND_SLOT {
                            continue;
                        }
                        let b = NodeId(resolved[other as usize]);
                        if a == b {
                            continue;
                        }
                        let Some(edge) = self.edge_between(a, b) else {
                            continue;
                        };
                        let Some(centroid) = self.edges[edge.0].centroid() else {
                            continue;
                        };

                        let point = [x - 1, y - 1, z - 1];
                        let dist: f64 = point
                            .iter()
                            .zip(centroid)
                            .map(|(&p, c)| (p as f64 - c).powi(2))
                            .sum();
                        let entry = best.entry(edge).or_insert((f64::INFINITY, point));
                        if dist < entry.0 {
                            *entry = (dist, point);
                        }
                    }
                }
            }
        }

        let located = best.len();
        for (edge, (_, point)) in best {
            self.edges[edge.0].location = Some(point);
        }

        located
    }
}
