//! # Wake Search Tree
//!
//! A binary space-partitioning tree over the sample points of one trailing
//! vortex. It answers "how far is field point `P` from this filament" in
//! `O(log N)` instead of scanning every wake node, and that distance decides
//! which agglomeration level the induced velocity is evaluated on.
//!
//! ## Core Concepts
//!
//! - The samples are recursively split in two along the longest axis of
//!   their bounding box, at the median sample.
//! - Each tree node stores the axis-aligned bounding box of its samples.
//! - Leaves hold at most [`LEAF_SIZE`] samples.
//! - A nearest-distance query descends the nearer child first and prunes any
//!   subtree whose bounding box is already farther than the best sample found.
//!
//! Every tree carries the geometry version it was built from. The owning
//! vortex bumps its version whenever a node moves, and querying a tree whose
//! version does not match is a programming error.

use super::states::NVec3;

/// Maximum number of samples stored in one leaf
pub const LEAF_SIZE: usize = 4;

/// A single node of the search tree.
///
/// Each node covers the samples `order[first..first + count]` of the tree:
/// - a leaf (`children == [None, None]`) checks those samples directly,
/// - an internal node delegates to its two children.
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub bbox_min: NVec3,
    pub bbox_max: NVec3,
    pub children: [Option<usize>; 2], // indices into SearchTree::nodes
    pub first: usize,
    pub count: usize,
}

/// Search tree over a snapshot of filament sample points.
///
/// This structure owns:
/// - a copy of the sample points (`points`),
/// - the sample ordering produced by the median splits (`order`),
/// - a vector of all tree nodes (`nodes`) and the `root` index.
#[derive(Debug, Clone)]
pub struct SearchTree {
    pub nodes: Vec<SearchNode>,
    pub root: usize,
    points: Vec<NVec3>,
    order: Vec<usize>,
    version: u64,
}

impl SearchTree {
    /// Build a search tree over `points`.
    ///
    /// This:
    /// 1. Copies the points so the tree never borrows the filament.
    /// 2. Creates a root covering every point.
    /// 3. Splits recursively at the median of the longest bbox axis until
    ///    nodes hold at most [`LEAF_SIZE`] points.
    ///
    /// # Parameters
    /// - `points` : sample points (finite wake nodes, never the node at infinity)
    /// - `version`: geometry version of the owner at build time
    pub fn build(points: &[NVec3], version: u64) -> Self {
        let mut tree = SearchTree {
            nodes: Vec::with_capacity(2 * points.len() / LEAF_SIZE + 1),
            root: 0,
            points: points.to_vec(),
            order: (0..points.len()).collect(),
            version,
        };

        if !points.is_empty() {
            tree.root = tree.build_node(0, points.len());
        }

        tree
    }

    /// Geometry version this tree was built from
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of samples in the tree
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distance from `p` to the nearest sample, `f64::INFINITY` if empty
    pub fn nearest_distance(&self, p: &NVec3) -> f64 {
        self.nearest(p).map_or(f64::INFINITY, |(_, d)| d)
    }

    /// Index (into the points given to [`SearchTree::build`]) and distance of
    /// the sample closest to `p`
    pub fn nearest(&self, p: &NVec3) -> Option<(usize, f64)> {
        if self.points.is_empty() {
            return None;
        }

        let mut best = (usize::MAX, f64::INFINITY);
        self.traverse_node(self.root, p, &mut best);
        Some((best.0, best.1.sqrt()))
    }

    // helpers ==============================================================================

    /// Create the node covering `order[first..first + count]` and, if it is
    /// too large for a leaf, split it and create its children.
    ///
    /// Returns the index of the new node in `self.nodes`.
    fn build_node(&mut self, first: usize, count: usize) -> usize {
        let (bbox_min, bbox_max) = bounding_box(&self.points, &self.order[first..first + count]);

        let node_idx = self.nodes.len();
        self.nodes.push(SearchNode {
            bbox_min,
            bbox_max,
            children: [None; 2],
            first,
            count,
        });

        if count <= LEAF_SIZE {
            return node_idx;
        }

        // Split along the longest axis at the median sample
        let extent = bbox_max - bbox_min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        let half = count / 2;
        let points = &self.points;
        self.order[first..first + count]
            .select_nth_unstable_by(half, |a, b| points[*a][axis].total_cmp(&points[*b][axis]));

        let left = self.build_node(first, half);
        let right = self.build_node(first + half, count - half);
        self.nodes[node_idx].children = [Some(left), Some(right)];

        node_idx
    }

    /// Recursively search a subtree for the sample closest to `p`.
    ///
    /// - Subtrees whose bbox is farther than the current best are skipped.
    /// - Leaves compare their samples directly.
    /// - Internal nodes visit the child with the nearer bbox first, which
    ///   makes the pruning of the second child more likely.
    ///
    /// `best` holds `(sample index, squared distance)`.
    fn traverse_node(&self, node_idx: usize, p: &NVec3, best: &mut (usize, f64)) {
        let node = &self.nodes[node_idx];

        if bbox_distance_squared(p, &node.bbox_min, &node.bbox_max) >= best.1 {
            return;
        }

        match node.children {
            [Some(left), Some(right)] => {
                let dl = bbox_distance_squared(p, &self.nodes[left].bbox_min, &self.nodes[left].bbox_max);
                let dr = bbox_distance_squared(p, &self.nodes[right].bbox_min, &self.nodes[right].bbox_max);
                let (near, far) = if dl <= dr { (left, right) } else { (right, left) };
                self.traverse_node(near, p, best);
                self.traverse_node(far, p, best);
            }
            _ => {
                for &i in &self.order[node.first..node.first + node.count] {
                    let d2 = (self.points[i] - p).norm_squared();
                    if d2 < best.1 {
                        *best = (i, d2);
                    }
                }
            }
        }
    }
}

// helpers ===========================================================================

/// Axis-aligned bounding box of the points selected by `indices`
fn bounding_box(points: &[NVec3], indices: &[usize]) -> (NVec3, NVec3) {
    let mut min = NVec3::repeat(f64::INFINITY);
    let mut max = NVec3::repeat(f64::NEG_INFINITY);

    for &i in indices {
        min = min.inf(&points[i]);
        max = max.sup(&points[i]);
    }

    (min, max)
}

/// Squared distance from `p` to the box `[min, max]`, zero if inside
fn bbox_distance_squared(p: &NVec3, min: &NVec3, max: &NVec3) -> f64 {
    let mut d2 = 0.0;
    for k in 0..3 {
        let d = if p[k] < min[k] {
            min[k] - p[k]
        } else if p[k] > max[k] {
            p[k] - max[k]
        } else {
            0.0
        };
        d2 += d * d;
    }
    d2
}
