//! # Grid
//!
//! Paneled surface mesh the wake is shed from.
//!
//! A grid is filled with nodes and loops (any polygon, usually triangles or
//! quads), then derived in a fixed order:
//!
//! 1. [`Grid::create_tri_edges`]: unique edges with their one or two loops,
//!    sorted canonically
//! 2. [`Grid::calculate_tri_normals_and_centroids`]: Newell normal, area,
//!    centroid per loop
//! 3. [`Grid::mark_trailing_edge`] then [`Grid::find_kutta_nodes`]: the nodes
//!    that shed trailing vortices
//! 4. [`Grid::calculate_upwind_edges`] and [`Grid::create_upwind_edge_data`]
//!    for a given flow direction
//!
//! Degenerate elements are flagged and reported as [`GridIssue`]s; derivation
//! keeps going for the rest of the mesh.

use std::collections::HashMap;

use log::{debug, warn};
use nalgebra::UnitQuaternion;

use super::elements::{Edge, ElementList, KuttaNode, Loop, Node, Surface, SurfaceKind};
use super::merge_sort::sort_edges;
use crate::error::GridIssue;
use crate::simulation::states::NVec3;
use crate::simulation::trailing_vortex::rigid_motion;
use crate::simulation::velocity::{segment_velocity, VelocitySource};

/// Loop normals shorter than this (relative to the squared loop size) are degenerate
pub const DEGENERATE_NORMAL_TOLERANCE: f64 = 1.0e-12;

/// Upwind scores closer than this (relative to loop size) count as a tie
pub const UPWIND_TIE_TOLERANCE: f64 = 1.0e-9;

#[derive(Debug, Default)]
pub struct Grid<'a> {
    pub name: String,
    nodes: ElementList<'a, Node>,
    loops: ElementList<'a, Loop>,
    edges: ElementList<'a, Edge>,
    surfaces: Vec<Surface>,
    kutta_nodes: Vec<KuttaNode>,
    min_loop_area: f64,
    core_size: f64, // regularization of the surface lattice
    issues: Vec<GridIssue>,
}

impl<'a> Grid<'a> {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    // =========================================================================================
    // Storage
    // =========================================================================================

    pub fn size_node_list(&mut self, num_nodes: usize) {
        self.nodes = ElementList::Owned(vec![Node::default(); num_nodes]);
    }

    pub fn size_loop_list(&mut self, num_loops: usize) {
        self.loops = ElementList::Owned(vec![Loop::default(); num_loops]);
    }

    pub fn size_edge_list(&mut self, num_edges: usize) {
        self.edges = ElementList::Owned(vec![Edge::default(); num_edges]);
    }

    /// Work directly on a caller-owned node array
    pub fn use_this_node_list(&mut self, nodes: &'a mut [Node]) {
        self.nodes = ElementList::Borrowed(nodes);
    }

    pub fn use_this_loop_list(&mut self, loops: &'a mut [Loop]) {
        self.loops = ElementList::Borrowed(loops);
    }

    pub fn use_this_edge_list(&mut self, edges: &'a mut [Edge]) {
        self.edges = ElementList::Borrowed(edges);
    }

    pub fn add_surface(&mut self, surface: Surface) -> usize {
        self.surfaces.push(surface);
        self.surfaces.len() - 1
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loops_mut(&mut self) -> &mut [Loop] {
        &mut self.loops
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn number_of_loops(&self) -> usize {
        self.loops.len()
    }

    pub fn number_of_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn min_loop_area(&self) -> f64 {
        self.min_loop_area
    }

    pub fn core_size(&self) -> f64 {
        self.core_size
    }

    pub fn set_core_size(&mut self, core_size: f64) {
        self.core_size = core_size;
    }

    /// Every issue found by the derivation steps so far
    pub fn issues(&self) -> &[GridIssue] {
        &self.issues
    }

    // =========================================================================================
    // Derivation
    // =========================================================================================

    /// Build the unique edge list from the loops.
    ///
    /// Each edge records the loop that first traversed it (and fixes its
    /// direction) and the loop on the other side, if any. Edges are then put in
    /// canonical order and the loops' edge indices remapped.
    pub fn create_tri_edges(&mut self) -> Vec<GridIssue> {
        let mut issues = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        let mut lookup: HashMap<(usize, usize), usize> = HashMap::new();

        for l in 0..self.loops.len() {
            let num = self.loops[l].nodes.len();
            let mut loop_edges = Vec::with_capacity(num);

            for k in 0..num {
                let a = self.loops[l].nodes[k];
                let b = self.loops[l].nodes[(k + 1) % num];

                if a == b || (self.nodes[a].xyz - self.nodes[b].xyz).norm() == 0.0 {
                    issues.push(GridIssue::ZeroLengthEdge { loop_id: l, node1: a, node2: b });
                    self.loops[l].degenerate = true;
                    continue;
                }

                let key = (a.min(b), a.max(b));
                match lookup.get(&key).copied() {
                    Some(e) => {
                        if edges[e].loop2.is_some() {
                            issues.push(GridIssue::NonManifoldEdge { node1: key.0, node2: key.1 });
                            self.loops[l].degenerate = true;
                        } else {
                            edges[e].loop2 = Some(l);
                        }
                        loop_edges.push(e);
                    }
                    None => {
                        lookup.insert(key, edges.len());
                        loop_edges.push(edges.len());
                        edges.push(Edge {
                            node1: a,
                            node2: b,
                            loop1: Some(l),
                            surface: self.loops[l].surface,
                            ..Default::default()
                        });
                    }
                }
            }

            self.loops[l].edges = loop_edges;
        }

        // canonical order
        let order = sort_edges(&edges);
        let mut new_index = vec![0; edges.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        for lp in self.loops.iter_mut() {
            lp.edges.iter_mut().for_each(|e| *e = new_index[*e]);
        }
        self.edges = ElementList::Owned(order.iter().map(|&old| edges[old]).collect());

        for node in self.nodes.iter_mut() {
            node.on_boundary = false;
        }
        for e in 0..self.edges.len() {
            if self.edges[e].is_boundary() {
                let (n1, n2) = (self.edges[e].node1, self.edges[e].node2);
                self.nodes[n1].on_boundary = true;
                self.nodes[n2].on_boundary = true;
            }
        }

        issues.extend(self.check_orientation());
        debug!("grid {}: {} edges from {} loops", self.name, self.edges.len(), self.loops.len());

        self.report(&issues);
        issues
    }

    /// Loops sharing an edge must traverse it in opposite directions
    pub fn check_orientation(&self) -> Vec<GridIssue> {
        let mut issues = Vec::new();

        for (e, edge) in self.edges.iter().enumerate() {
            if let (Some(l1), Some(l2)) = (edge.loop1, edge.loop2) {
                let forward1 = self.loops[l1].traverses(edge.node1, edge.node2);
                let forward2 = self.loops[l2].traverses(edge.node1, edge.node2);
                if forward1 == forward2 {
                    issues.push(GridIssue::InconsistentOrientation { edge: e, loop1: l1, loop2: l2 });
                }
            }
        }

        issues
    }

    /// Newell normal, area and centroid of every loop. Loops with a
    /// vanishing normal are flagged degenerate and get a zero normal.
    pub fn calculate_tri_normals_and_centroids(&mut self) -> Vec<GridIssue> {
        let mut issues = Vec::new();
        let mut min_area = f64::INFINITY;

        for l in 0..self.loops.len() {
            let (centroid, area_vector, size) = loop_geometry(&self.nodes, &self.loops[l].nodes);
            let magnitude = area_vector.norm();
            let lp = &mut self.loops[l];
            lp.centroid = centroid;

            if magnitude <= DEGENERATE_NORMAL_TOLERANCE * size * size {
                issues.push(GridIssue::ZeroNormal { loop_id: l, magnitude });
                lp.degenerate = true;
                lp.normal = NVec3::zeros();
                lp.area = 0.0;
            } else {
                lp.normal = area_vector / magnitude;
                lp.area = magnitude;
                min_area = min_area.min(magnitude);
            }
        }

        self.min_loop_area = if min_area.is_finite() { min_area } else { 0.0 };

        self.report(&issues);
        issues
    }

    /// For every loop pick the side facing the oncoming flow.
    ///
    /// The flow is projected onto the loop plane; the upwind edge is the one
    /// whose mid-point lies farthest against that projected direction. Near
    /// ties go to the lowest edge index. Loops without a tangential flow
    /// component, or degenerate loops, get no upwind edge.
    pub fn calculate_upwind_edges(&mut self, flow: &NVec3) {
        for l in 0..self.loops.len() {
            let lp = &self.loops[l];
            let tangential = flow - flow.dot(&lp.normal) * lp.normal;
            let speed = tangential.norm();

            if lp.degenerate || speed <= 0.0 || lp.edges.is_empty() {
                self.loops[l].upwind_edge = None;
                continue;
            }

            let q = tangential / speed;
            let size = lp.area.sqrt();
            let mut best: Option<(usize, f64)> = None;

            for &e in &lp.edges {
                let edge = &self.edges[e];
                let mid = 0.5 * (self.nodes[edge.node1].xyz + self.nodes[edge.node2].xyz);
                let score = -(mid - lp.centroid).dot(&q);

                best = match best {
                    None => Some((e, score)),
                    Some((be, bs)) => {
                        let tie = (score - bs).abs() <= UPWIND_TIE_TOLERANCE * size;
                        if (tie && e < be) || (!tie && score > bs) {
                            Some((e, score))
                        } else {
                            Some((be, bs))
                        }
                    }
                };
            }

            self.loops[l].upwind_edge = best.map(|(e, _)| e);
        }
    }

    /// Loop across each upwind edge and the offset to reach it: the
    /// neighbor's centroid, or the edge mid-point on a boundary
    pub fn create_upwind_edge_data(&mut self) {
        for l in 0..self.loops.len() {
            let Some(e) = self.loops[l].upwind_edge else {
                self.loops[l].upwind_loop = None;
                self.loops[l].upwind_offset = NVec3::zeros();
                continue;
            };

            let edge = self.edges[e];
            let centroid = self.loops[l].centroid;
            let upwind_loop = edge.other_loop(l);
            let target = match upwind_loop {
                Some(u) => self.loops[u].centroid,
                None => 0.5 * (self.nodes[edge.node1].xyz + self.nodes[edge.node2].xyz),
            };

            self.loops[l].upwind_loop = upwind_loop;
            self.loops[l].upwind_offset = target - centroid;
        }
    }

    /// Loops sharing at least one node with `loop_id`, ascending
    pub fn loop_neighbors(&self, loop_id: usize) -> Vec<usize> {
        let own = &self.loops[loop_id].nodes;
        (0..self.loops.len())
            .filter(|&l| l != loop_id && self.loops[l].nodes.iter().any(|n| own.contains(n)))
            .collect()
    }

    // =========================================================================================
    // Trailing edge and kutta nodes
    // =========================================================================================

    /// Flag the edge between `node1` and `node2` as trailing edge. Returns
    /// false if no such edge exists.
    pub fn mark_trailing_edge(&mut self, node1: usize, node2: usize) -> bool {
        let key = (node1.min(node2), node1.max(node2));
        match self.edges.iter_mut().find(|e| e.key() == key) {
            Some(edge) => {
                edge.trailing_edge = true;
                true
            }
            None => {
                warn!("grid {}: no edge between nodes {node1} and {node2} to mark as trailing edge", self.name);
                false
            }
        }
    }

    pub fn size_kutta_node_list(&mut self, num_kutta_nodes: usize) {
        self.kutta_nodes = vec![KuttaNode::default(); num_kutta_nodes];
    }

    pub fn number_of_kutta_nodes(&self) -> usize {
        self.kutta_nodes.len()
    }

    pub fn kutta_node(&self, i: usize) -> &KuttaNode {
        &self.kutta_nodes[i]
    }

    pub fn kutta_nodes(&self) -> &[KuttaNode] {
        &self.kutta_nodes
    }

    /// Collect the kutta nodes: every node on a trailing-edge edge of a wing
    /// surface, walked chain by chain so `s_over_b` runs along the span.
    /// Chain ends are wingtips unless the surface is periodic.
    ///
    /// Returns the number of kutta nodes.
    pub fn find_kutta_nodes(&mut self) -> usize {
        let mut found: Vec<KuttaNode> = Vec::new();

        for (s, surface) in self.surfaces.iter().enumerate() {
            if surface.kind != SurfaceKind::Wing {
                continue;
            }

            let te_edges: Vec<usize> = (0..self.edges.len())
                .filter(|&e| self.edges[e].trailing_edge && self.edges[e].surface == s)
                .collect();

            for chain in trailing_edge_chains(&self.edges, &te_edges) {
                let points: Vec<NVec3> = chain.iter().map(|&n| self.nodes[n].xyz).collect();
                let mut arc = vec![0.0; points.len()];
                for k in 1..points.len() {
                    arc[k] = arc[k - 1] + (points[k] - points[k - 1]).norm();
                }
                let total = arc.last().copied().unwrap_or(0.0);

                let closed = chain.len() > 2 && chain.first() == chain.last();
                let count = if closed { chain.len() - 1 } else { chain.len() };

                for k in 0..count {
                    let end = k == 0 || k == chain.len() - 1;
                    found.push(KuttaNode {
                        node: chain[k],
                        surface: s,
                        component: surface.component,
                        periodic: surface.periodic,
                        wingtip: end && !surface.periodic && !closed,
                        trailing_edge: points[k],
                        s_over_b: if total > 0.0 { arc[k] / total } else { 0.0 },
                    });
                }
            }
        }

        for node in self.nodes.iter_mut() {
            node.is_kutta_node = false;
        }
        for kn in &found {
            self.nodes[kn.node].is_kutta_node = true;
        }

        self.size_kutta_node_list(found.len());
        self.kutta_nodes.copy_from_slice(&found);

        debug!("grid {}: {} kutta nodes", self.name, self.kutta_nodes.len());
        self.kutta_nodes.len()
    }

    /// Refresh the trailing-edge points of the kutta nodes from the nodes
    pub fn update_kutta_node_locations(&mut self) {
        for kn in self.kutta_nodes.iter_mut() {
            kn.trailing_edge = self.nodes[kn.node].xyz;
        }
    }

    // =========================================================================================
    // Circulation
    // =========================================================================================

    /// Net edge circulation from the loop ring vortices: each loop adds its
    /// gamma along its own traversal direction
    pub fn update_edge_circulation(&mut self) {
        for e in 0..self.edges.len() {
            let edge = self.edges[e];
            let mut gamma = 0.0;
            for l in [edge.loop1, edge.loop2].into_iter().flatten() {
                let lp = &self.loops[l];
                if lp.traverses(edge.node1, edge.node2) {
                    gamma += lp.gamma;
                } else {
                    gamma -= lp.gamma;
                }
            }
            self.edges[e].gamma = gamma;
        }
    }

    /// Circulation shed into the wake at kutta node `k`: net circulation of
    /// the trailing-edge edges arriving at the node minus those leaving it
    pub fn kutta_node_circulation(&self, k: usize) -> f64 {
        let kn = &self.kutta_nodes[k];
        self.edges
            .iter()
            .filter(|e| e.trailing_edge && e.surface == kn.surface && e.touches(kn.node))
            .map(|e| if e.node2 == kn.node { e.gamma } else { -e.gamma })
            .sum()
    }

    // =========================================================================================
    // Motion
    // =========================================================================================

    /// Rigidly move every node whose component is selected in `group`
    /// (indexed by component id), then refresh loop geometry and kutta
    /// node locations. Identity motions leave every bit unchanged.
    pub fn update_geometry_location(
        &mut self,
        translation: &NVec3,
        origin: &NVec3,
        rotation: &UnitQuaternion<f64>,
        group: &[bool],
    ) {
        for node in self.nodes.iter_mut() {
            if group.get(node.component).copied().unwrap_or(false) {
                node.xyz = rigid_motion(&node.xyz, translation, origin, rotation);
            }
        }

        let issues = self.calculate_tri_normals_and_centroids();
        if !issues.is_empty() {
            warn!("grid {}: motion produced {} degenerate loops", self.name, issues.len());
        }
        self.update_kutta_node_locations();
    }

    // helpers ==============================================================================

    fn report(&mut self, issues: &[GridIssue]) {
        for issue in issues {
            warn!("grid {}: {issue}", self.name);
        }
        self.issues.extend_from_slice(issues);
    }
}

/// The surface lattice: every non trailing-edge edge as a bound vortex
/// segment. Trailing-edge edges are represented by the shed filaments.
impl VelocitySource for Grid<'_> {
    fn velocity(&self, p: &NVec3) -> NVec3 {
        self.edges
            .iter()
            .filter(|e| !e.trailing_edge && e.gamma != 0.0)
            .fold(NVec3::zeros(), |acc, e| {
                acc + segment_velocity(&self.nodes[e.node1].xyz, &self.nodes[e.node2].xyz, e.gamma, self.core_size, p)
            })
    }
}

// helpers ===========================================================================

/// Centroid, Newell area vector (normal times area) and largest extent of a polygon
fn loop_geometry(nodes: &[Node], ids: &[usize]) -> (NVec3, NVec3, f64) {
    let n = ids.len();
    if n == 0 {
        return (NVec3::zeros(), NVec3::zeros(), 0.0);
    }

    let centroid = ids.iter().fold(NVec3::zeros(), |acc, &i| acc + nodes[i].xyz) / n as f64;

    let mut area = NVec3::zeros();
    let mut size: f64 = 0.0;
    for k in 0..n {
        let a = nodes[ids[k]].xyz - centroid;
        let b = nodes[ids[(k + 1) % n]].xyz - centroid;
        area += 0.5 * a.cross(&b);
        size = size.max(a.norm());
    }

    (centroid, area, size)
}

/// Group trailing-edge edges into node chains. Open chains start at their
/// lowest-numbered end node; closed chains start at their lowest node and
/// repeat it at the end.
fn trailing_edge_chains(edges: &[Edge], te_edges: &[usize]) -> Vec<Vec<usize>> {
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for &e in te_edges {
        adjacency.entry(edges[e].node1).or_default().push(e);
        adjacency.entry(edges[e].node2).or_default().push(e);
    }

    let mut starts: Vec<usize> = adjacency.keys().copied().collect();
    // open chain ends first, then everything else, lowest index first
    starts.sort_by_key(|n| (adjacency[n].len() != 1, *n));

    let mut used = vec![false; edges.len()];
    let mut chains = Vec::new();

    for start in starts {
        if adjacency[&start].iter().all(|&e| used[e]) {
            continue;
        }

        let mut chain = vec![start];
        let mut current = start;
        loop {
            let next = adjacency[&current].iter().copied().filter(|&e| !used[e]).min();
            let Some(e) = next else { break };
            used[e] = true;
            current = if edges[e].node1 == current { edges[e].node2 } else { edges[e].node1 };
            chain.push(current);
        }
        chains.push(chain);
    }

    chains
}
