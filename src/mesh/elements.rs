//! Mesh element records: nodes, edges, loops, surfaces and kutta nodes,
//! plus [`ElementList`], the owned-or-borrowed storage a grid keeps them in.

use std::ops::{Deref, DerefMut};

use crate::simulation::states::NVec3;

/// Surface mesh node
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Node {
    pub xyz: NVec3,
    pub component: usize, // component id, selects the node in group motions
    pub on_boundary: bool, // touches an edge with a single loop
    pub is_kutta_node: bool, // sheds a trailing vortex
}

impl Node {
    pub fn new(xyz: NVec3, component: usize) -> Self {
        Self { xyz, component, ..Default::default() }
    }
}

/// Surface edge, oriented `node1 -> node2` as first traversed by `loop1`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Edge {
    pub node1: usize,
    pub node2: usize,
    pub loop1: Option<usize>,
    pub loop2: Option<usize>,
    pub gamma: f64, // net bound circulation along node1 -> node2
    pub surface: usize,
    pub trailing_edge: bool,
}

impl Edge {
    /// Order-independent key identifying the edge by its end nodes
    pub fn key(&self) -> (usize, usize) {
        (self.node1.min(self.node2), self.node1.max(self.node2))
    }

    /// Loop on the other side of `loop_id`, `None` on a boundary
    pub fn other_loop(&self, loop_id: usize) -> Option<usize> {
        if self.loop1 == Some(loop_id) {
            self.loop2
        } else if self.loop2 == Some(loop_id) {
            self.loop1
        } else {
            None
        }
    }

    pub fn is_boundary(&self) -> bool {
        self.loop2.is_none()
    }

    pub fn touches(&self, node: usize) -> bool {
        self.node1 == node || self.node2 == node
    }
}

/// Surface panel: a closed polygon carrying a ring-vortex circulation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Loop {
    pub nodes: Vec<usize>, // polygon nodes, counter-clockwise about `normal`
    pub edges: Vec<usize>, // sides in traversal order, filled by create_tri_edges
    pub surface: usize,
    pub gamma: f64,
    pub centroid: NVec3,
    pub normal: NVec3,
    pub area: f64,
    pub degenerate: bool,
    pub upwind_edge: Option<usize>,
    pub upwind_loop: Option<usize>, // loop across the upwind edge
    pub upwind_offset: NVec3, // from this centroid to the upwind loop centroid (or edge mid-point)
}

impl Loop {
    pub fn new(nodes: Vec<usize>, surface: usize, gamma: f64) -> Self {
        Self { nodes, surface, gamma, ..Default::default() }
    }

    /// Whether the loop runs `a -> b` along one of its sides
    pub fn traverses(&self, a: usize, b: usize) -> bool {
        let n = self.nodes.len();
        (0..n).any(|k| self.nodes[k] == a && self.nodes[(k + 1) % n] == b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceKind {
    #[default]
    Wing,
    Body,
}

/// One lifting or non-lifting surface of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Surface {
    pub component: usize,
    pub kind: SurfaceKind,
    pub periodic: bool, // wraps around (nacelle), its trailing edge has no tips
}

/// Trailing-edge node that sheds a vortex, with everything the vortex needs
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KuttaNode {
    pub node: usize,
    pub surface: usize,
    pub component: usize,
    pub periodic: bool,
    pub wingtip: bool,
    pub trailing_edge: NVec3,
    pub s_over_b: f64, // arc-length fraction along the trailing edge
}

/// Grid storage that either owns its elements or works on a caller's slice
#[derive(Debug)]
pub enum ElementList<'a, T> {
    Owned(Vec<T>),
    Borrowed(&'a mut [T]),
}

impl<T> Default for ElementList<'_, T> {
    fn default() -> Self {
        ElementList::Owned(Vec::new())
    }
}

impl<T> ElementList<'_, T> {
    pub fn is_owned(&self) -> bool {
        matches!(self, ElementList::Owned(_))
    }
}

impl<T> Deref for ElementList<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            ElementList::Owned(v) => v,
            ElementList::Borrowed(s) => s,
        }
    }
}

impl<T> DerefMut for ElementList<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            ElementList::Owned(v) => v,
            ElementList::Borrowed(s) => s,
        }
    }
}
