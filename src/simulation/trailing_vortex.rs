//! # Trailing Vortex
//!
//! One semi-infinite vortex filament shed from one kutta node.
//!
//! The finest level is a polyline of `N + 1` wake nodes running from the
//! trailing edge out to `far_dist`, followed by a semi-infinite segment that
//! reaches "infinity" along the free-stream direction. `N` is a power of two
//! so the filament can be agglomerated: level `l` holds `N / 2^(l-1)`
//! sub-vortices, each one the chord between every `2^(l-1)`-th fine node,
//! down to a single sub-vortex on the coarsest level `L = log2(N) + 1`.
//!
//! ## Induced velocity
//!
//! Like the opening-angle test of a treecode, the distance from the field
//! point to the filament (from the [`SearchTree`]) picks the coarsest level
//! whose longest sub-vortex is still short compared to that distance:
//!
//! ```text
//! level l is admissible  <=>  distance >= far_away_ratio * max_length(l)
//! ```
//!
//! Every sub-vortex of the chosen level plus the infinite segment is then
//! summed with the regularized kernel.
//!
//! ## Wake update
//!
//! Edge velocities are accumulated from outside (free stream, surface, all
//! filaments) and consumed by [`TrailingVortex::update_wake_location`]. What
//! the update does depends on the [`AnalysisMode`]: relax toward the local
//! streamline, convect in time, or only expose adjoint residuals.
//!
//! Coarse levels are never stored independently: they are re-derived from
//! the finest level after every change, which keeps checkpoint/restore exact.

use std::sync::OnceLock;

use log::{debug, info};
use nalgebra::UnitQuaternion;

use super::mode::{AnalysisMode, ConvectType, WakeStep};
use super::params::WakeParameters;
use super::search::SearchTree;
use super::states::{NVec3, VortexEdge, VortexId, WakeNode};
use super::velocity::VelocitySource;

/// Distance to the point standing in for "infinity", as a multiple of `far_dist`
pub const INFINITY_FACTOR: f64 = 1.0e4;

/// Clustering of wake nodes toward the trailing edge in steady analyses
/// (0 = uniform, 1 = quadratic)
pub const WAKE_STRETCHING: f64 = 0.5;

/// Minimum downstream speed (fraction of Vinf) kept by the velocity limiter
pub const MIN_DOWNSTREAM_FRACTION: f64 = 0.1;

/// Speeds below this carry no usable direction
const TINY_SPEED: f64 = 1.0e-12;

/// Life cycle of a trailing vortex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VortexState {
    Uninitialized,
    Ready,
    Checkpointed,
    Converged,
}

/// Result of one induced-velocity evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocitySample {
    pub velocity: NVec3,
    pub distance: f64, // distance from the field point to the nearest wake node
    pub level: usize, // agglomeration level the sum was done on
}

#[derive(Debug, Clone)]
pub struct TrailingVortex {
    pub(crate) id: VortexId,
    pub(crate) params: WakeParameters,
    pub(crate) mode: AnalysisMode,
    pub(crate) state: VortexState,
    pub(crate) evaluate: bool, // picked up by agglomerated evaluation loops

    // geometry
    pub(crate) far_dist: f64,
    pub(crate) s: Vec<f64>, // arc-length station of each fine node from the TE
    pub(crate) te_node: WakeNode,
    pub(crate) nodes: Vec<WakeNode>, // N + 1 fine nodes, nodes[0] sits on the TE
    pub(crate) infinity_node: NVec3,
    pub(crate) infinity_dir: NVec3,

    // agglomeration levels, levels[0] is level 1 (finest)
    pub(crate) levels: Vec<Vec<VortexEdge>>,
    pub(crate) level_max_length: Vec<f64>,
    pub(crate) far_edge: VortexEdge,
    pub(crate) edge_velocity: Vec<Vec<NVec3>>,

    // circulation, gamma[i] for fine sub-vortex i and gamma[N] for the infinite segment
    pub(crate) gamma: Vec<f64>,
    pub(crate) gamma_saved: Vec<f64>,
    pub(crate) wake_age: Vec<f64>,
    pub(crate) wake_age_saved: Vec<f64>,
    pub(crate) saved_time_step: Option<usize>,
    pub(crate) has_shape_checkpoint: bool,

    // kinematics
    pub(crate) free_stream: NVec3,
    pub(crate) vinf: f64,
    pub(crate) current_time_step: usize,
    pub(crate) s_over_b: f64,

    // adjoint, one entry per wake node 1..=N
    pub(crate) residual: Vec<NVec3>,
    pub(crate) equation_numbers: Vec<[usize; 3]>,

    // spatial search
    pub(crate) geometry_version: u64,
    pub(crate) search: OnceLock<SearchTree>,
    pub(crate) searched: bool,
    pub(crate) distance: f64,
}

impl TrailingVortex {
    /// An uninitialized vortex; call [`TrailingVortex::setup`] before use
    pub fn new(id: VortexId, params: WakeParameters, mode: AnalysisMode) -> Self {
        Self {
            id,
            params,
            mode,
            state: VortexState::Uninitialized,
            evaluate: true,
            far_dist: 0.0,
            s: Vec::new(),
            te_node: WakeNode::new(NVec3::zeros()),
            nodes: Vec::new(),
            infinity_node: NVec3::zeros(),
            infinity_dir: NVec3::x(),
            levels: Vec::new(),
            level_max_length: Vec::new(),
            far_edge: VortexEdge::default(),
            edge_velocity: Vec::new(),
            gamma: Vec::new(),
            gamma_saved: Vec::new(),
            wake_age: Vec::new(),
            wake_age_saved: Vec::new(),
            saved_time_step: None,
            has_shape_checkpoint: false,
            free_stream: NVec3::zeros(),
            vinf: 0.0,
            current_time_step: 0,
            s_over_b: 0.0,
            residual: Vec::new(),
            equation_numbers: Vec::new(),
            geometry_version: 0,
            search: OnceLock::new(),
            searched: false,
            distance: 0.0,
        }
    }

    /// Allocate the wake: `num_sub_vortices` segments from `te` out to
    /// `far_dist` along the direction of `downstream - te`, then one
    /// semi-infinite segment. `downstream` is kept as the node at infinity.
    ///
    /// # Panics
    /// If `num_sub_vortices` is not a power of two or `downstream == te`.
    pub fn setup(&mut self, num_sub_vortices: usize, far_dist: f64, te: NVec3, downstream: NVec3) {
        assert!(
            num_sub_vortices.is_power_of_two(),
            "number of sub-vortices must be a power of two, got {num_sub_vortices}"
        );
        assert!((downstream - te).norm() > 0.0, "node at infinity coincides with the trailing edge");

        let n = num_sub_vortices;
        let num_levels = n.trailing_zeros() as usize + 1;
        let gamma_te = self.gamma.first().copied().unwrap_or(0.0);

        self.s = vec![0.0; n + 1];
        self.nodes = vec![WakeNode::new(te); n + 1];
        self.gamma = vec![gamma_te; n + 1];
        self.gamma_saved = Vec::with_capacity(n + 1);
        self.wake_age = vec![0.0; n + 1];
        self.wake_age_saved = Vec::with_capacity(n + 1);
        self.levels = (0..num_levels).map(|l| vec![VortexEdge::default(); n >> l]).collect();
        self.level_max_length = vec![0.0; num_levels];
        self.edge_velocity = (0..num_levels).map(|l| vec![NVec3::zeros(); n >> l]).collect();
        self.residual = vec![NVec3::zeros(); n];
        self.equation_numbers = vec![[0; 3]; n];
        self.saved_time_step = None;
        self.has_shape_checkpoint = false;
        self.current_time_step = 0;
        self.state = VortexState::Ready;

        self.place_straight_wake(far_dist, te, downstream);

        info!(
            "trailing vortex (wing {}, node {}): {} sub-vortices, {} levels, far distance {:.4}",
            self.id.wing, self.id.node, n, num_levels, far_dist
        );
    }

    /// Re-derive a straight wake from a new trailing edge, far distance and
    /// node at infinity without reallocating anything, so the sequence of
    /// operations is identical between evaluations.
    pub fn update(&mut self, far_dist: f64, te: NVec3, downstream: NVec3) {
        self.assert_set_up();
        assert!((downstream - te).norm() > 0.0, "node at infinity coincides with the trailing edge");
        self.place_straight_wake(far_dist, te, downstream);
    }

    /// [`TrailingVortex::update`] keeping the far distance and wake direction
    pub fn update_new(&mut self, te: NVec3) {
        self.assert_set_up();
        let downstream = te + self.infinity_dir * (INFINITY_FACTOR * self.far_dist);
        self.place_straight_wake(self.far_dist, te, downstream);
    }

    fn place_straight_wake(&mut self, far_dist: f64, te: NVec3, downstream: NVec3) {
        let n = self.nodes.len() - 1;
        let uniform = self.mode.is_time_accurate();

        self.far_dist = far_dist;
        self.infinity_node = downstream;
        self.infinity_dir = (downstream - te).normalize();
        self.te_node.xyz = te;

        for i in 0..=n {
            let xi = i as f64 / n as f64;
            self.s[i] = if uniform {
                far_dist * xi
            } else {
                far_dist * ((1.0 - WAKE_STRETCHING) * xi + WAKE_STRETCHING * xi * xi)
            };
            self.nodes[i].xyz = te + self.infinity_dir * self.s[i];
        }

        self.rebuild_levels(true);
    }

    // =========================================================================================
    // Agglomeration levels
    // =========================================================================================

    /// Regenerate every level from the finest nodes, gammas and ages.
    ///
    /// With `geometry_changed` the geometry version is bumped and the search
    /// tree dropped, so the next query rebuilds it over the new positions.
    pub(crate) fn rebuild_levels(&mut self, geometry_changed: bool) {
        let n = self.nodes.len() - 1;

        for i in 0..n {
            let core = self.sub_vortex_core(i);
            let edge = &mut self.levels[0][i];
            edge.set_nodes(self.nodes[i].xyz, self.nodes[i + 1].xyz);
            edge.gamma = self.gamma[i];
            edge.core = core;
        }

        for l in 1..self.levels.len() {
            let stride = 1usize << l;
            for j in 0..self.levels[l].len() {
                let (a, b) = (j * stride, (j + 1) * stride);

                let fine = &self.levels[0][a..b];
                let path: f64 = fine.iter().map(|e| e.length).sum();
                let gamma = if path > 0.0 {
                    fine.iter().map(|e| e.gamma * e.length).sum::<f64>() / path
                } else {
                    fine.iter().map(|e| e.gamma).sum::<f64>() / stride as f64
                };
                let core = fine.iter().map(|e| e.core).fold(0.0, f64::max);

                let edge = &mut self.levels[l][j];
                edge.set_nodes(self.nodes[a].xyz, self.nodes[b].xyz);
                edge.gamma = gamma;
                edge.core = core;
            }
        }

        for (l, level) in self.levels.iter().enumerate() {
            self.level_max_length[l] = level.iter().map(|e| e.length).fold(0.0, f64::max);
        }

        let last = self.nodes[n].xyz;
        self.far_edge.set_nodes(last, last + self.infinity_dir * (INFINITY_FACTOR * self.far_dist));
        self.far_edge.direction = self.infinity_dir;
        self.far_edge.gamma = self.gamma[n];
        self.far_edge.core = self.sub_vortex_core(n);

        if geometry_changed {
            self.geometry_version += 1;
            self.search = OnceLock::new();
            self.searched = false;
        }
    }

    /// Core radius of fine sub-vortex `i`, grown with wake age when damping is on
    fn sub_vortex_core(&self, i: usize) -> f64 {
        let core = self.params.effective_core();
        if self.params.wake_damping && self.params.core_growth_rate > 0.0 {
            (core * core + self.params.core_growth_rate * self.wake_age[i]).sqrt()
        } else {
            core
        }
    }

    /// Number of agglomeration levels, `log2(N) + 1`
    pub fn number_of_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of times the finest level is halved, `log2(N)`
    pub fn number_of_agglomerations(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Finest-level sub-vortex count
    pub fn number_of_sub_vortices(&self) -> usize {
        self.levels.first().map_or(0, |l| l.len())
    }

    /// Sub-vortex count on `level` (1 = finest)
    pub fn number_of_sub_vortices_at(&self, level: usize) -> usize {
        self.levels[self.level_index(level)].len()
    }

    /// Sub-vortices summed over every level
    pub fn total_number_of_sub_vortices(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    /// Sub-vortex `i` of `level` (1 = finest)
    pub fn vortex_edge(&self, level: usize, i: usize) -> &VortexEdge {
        &self.levels[self.level_index(level)][i]
    }

    /// The semi-infinite segment closing the wake
    pub fn far_edge(&self) -> &VortexEdge {
        &self.far_edge
    }

    /// Longest sub-vortex on `level`
    pub fn max_sub_vortex_length(&self, level: usize) -> f64 {
        self.level_max_length[self.level_index(level)]
    }

    fn level_index(&self, level: usize) -> usize {
        assert!(
            level >= 1 && level <= self.levels.len(),
            "agglomeration level {level} outside 1..={}",
            self.levels.len()
        );
        level - 1
    }

    // =========================================================================================
    // Spatial search
    // =========================================================================================

    /// The search tree over the current finite wake nodes, built on first use
    /// after every geometry change.
    ///
    /// # Panics
    /// If the vortex is not set up, or the tree is stale.
    pub fn search_tree(&self) -> &SearchTree {
        self.assert_set_up();
        let tree = self.search.get_or_init(|| {
            let points: Vec<NVec3> = self.nodes.iter().map(|n| n.xyz).collect();
            SearchTree::build(&points, self.geometry_version)
        });
        assert_eq!(
            tree.version(),
            self.geometry_version,
            "wake search tree queried after a geometry update without a rebuild"
        );
        tree
    }

    /// Build the search tree now instead of on the first query
    pub fn create_search_tree(&mut self) {
        self.search_tree();
    }

    /// Distance from `p` to the nearest finite wake node
    pub fn distance_to(&self, p: &NVec3) -> f64 {
        self.search_tree().nearest_distance(p)
    }

    /// Distance query that also marks this vortex as searched, caching the
    /// distance for [`TrailingVortex::distance`]
    pub fn search(&mut self, p: &NVec3) -> f64 {
        let d = self.distance_to(p);
        self.searched = true;
        self.distance = d;
        d
    }

    pub fn searched(&self) -> bool {
        self.searched
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn clear_search_mark(&mut self) {
        self.searched = false;
    }

    // =========================================================================================
    // Induced velocity
    // =========================================================================================

    /// Coarsest level whose longest sub-vortex satisfies
    /// `distance >= far_away_ratio * length`, else the finest level
    pub fn select_level(&self, distance: f64) -> usize {
        for l in (1..=self.levels.len()).rev() {
            if distance >= self.params.far_away_ratio * self.level_max_length[l - 1] {
                return l;
            }
        }
        1
    }

    /// Velocity induced at `p` with the level chosen by distance
    pub fn induced_velocity(&self, p: &NVec3) -> NVec3 {
        self.evaluate_at(p, None).velocity
    }

    /// Velocity induced at `p` with every segment using `core` as its core
    /// radius (local self-influence)
    pub fn induced_velocity_with_core(&self, p: &NVec3, core: f64) -> NVec3 {
        self.evaluate_at(p, Some(core)).velocity
    }

    /// Induced velocity together with the distance and level used
    pub fn evaluate_at(&self, p: &NVec3, core_override: Option<f64>) -> VelocitySample {
        let distance = self.distance_to(p);
        let level = self.select_level(distance);
        let velocity = self.sum_level(p, level, core_override);

        VelocitySample { velocity, distance, level }
    }

    /// Induced velocity summed on a fixed `level`, no search involved
    pub fn induced_velocity_at_level(&self, p: &NVec3, level: usize) -> NVec3 {
        self.assert_set_up();
        self.sum_level(p, level, None)
    }

    fn sum_level(&self, p: &NVec3, level: usize, core_override: Option<f64>) -> NVec3 {
        let edges = &self.levels[self.level_index(level)];
        let finite = edges
            .iter()
            .fold(NVec3::zeros(), |acc, e| acc + e.induced_velocity(p, core_override));
        finite + self.far_edge.induced_velocity_semi_infinite(p, core_override)
    }

    /// Free stream plus blade-frame velocity at `p` for this vortex's mode
    pub fn onset_velocity(&self, p: &NVec3) -> NVec3 {
        self.mode.onset_velocity(&self.free_stream, p)
    }

    /// Induced plus onset velocity, for a filament considered on its own.
    /// Solvers summing many filaments add the onset velocity once instead.
    pub fn total_velocity(&self, p: &NVec3) -> NVec3 {
        self.induced_velocity(p) + self.onset_velocity(p)
    }

    // =========================================================================================
    // Circulation
    // =========================================================================================

    /// Trailing-edge circulation
    pub fn gamma(&self) -> f64 {
        self.gamma[0]
    }

    /// Circulation of fine sub-vortex `i` (`i == N` is the infinite segment)
    pub fn gamma_at(&self, i: usize) -> f64 {
        self.gamma[i]
    }

    /// Set the trailing-edge circulation. Steady wakes carry it along the
    /// whole filament; time-accurate wakes only change the newest packet.
    pub fn set_gamma(&mut self, gamma: f64) {
        self.assert_set_up();
        self.gamma[0] = gamma;
        self.update_gamma();
    }

    /// Set the circulation of one fine sub-vortex directly
    pub fn set_gamma_at(&mut self, i: usize, gamma: f64) {
        self.assert_set_up();
        self.gamma[i] = gamma;
        self.rebuild_levels(false);
    }

    /// Push the circulation values into the sub-vortices of every level
    pub fn update_gamma(&mut self) {
        self.assert_set_up();
        if !self.mode.is_time_accurate() {
            let g = self.gamma[0];
            self.gamma.iter_mut().for_each(|v| *v = g);
        }
        self.rebuild_levels(false);
    }

    // =========================================================================================
    // Edge velocity accumulators
    // =========================================================================================

    /// Zero the edge velocities on every level
    pub fn zero_edge_velocities(&mut self) {
        for level in &mut self.edge_velocity {
            level.iter_mut().for_each(|q| *q = NVec3::zeros());
        }
    }

    /// Velocity accumulated on sub-vortex `i` of `level`
    pub fn edge_velocity(&self, level: usize, i: usize) -> NVec3 {
        self.edge_velocity[self.level_index(level)][i]
    }

    pub fn edge_velocity_mut(&mut self, level: usize, i: usize) -> &mut NVec3 {
        let l = self.level_index(level);
        &mut self.edge_velocity[l][i]
    }

    /// Add every coarse-level edge velocity into its two children, coarsest
    /// first, so the finest level ends up holding the full velocity
    pub fn prolongate_edge_velocities(&mut self) {
        for l in (1..self.edge_velocity.len()).rev() {
            let (fine, coarse) = self.edge_velocity.split_at_mut(l);
            let fine = &mut fine[l - 1];
            for (j, q) in fine.iter_mut().enumerate() {
                *q += coarse[0][j / 2];
            }
        }
    }

    // =========================================================================================
    // Wake shape update
    // =========================================================================================

    /// Move the wake with the finest-level edge velocities.
    ///
    /// - steady: each node relaxes toward the streamline traced from the
    ///   trailing edge, by `wake_relax`
    /// - time accurate / rotor: nodes convect one physical step
    /// - adjoint: nodes stay put, the streamline residual is stored
    ///
    /// Returns the largest node movement (or residual magnitude in adjoint mode).
    pub fn update_wake_location(&mut self) -> f64 {
        self.assert_set_up();

        let mut q: Vec<NVec3> = self.edge_velocity[0].clone();
        for v in q.iter_mut() {
            self.limit_velocity(v);
        }
        if self.params.wake_damping {
            smooth_velocity(&mut q);
        }

        let residual = match self.mode.wake_step(self.params.wake_relax) {
            WakeStep::Relax(relax) => self.relax_to_streamline(&q, relax),
            WakeStep::Convect { time_step, .. } => self.convect_nodes(&q, time_step),
            WakeStep::Residual => self.compute_wake_residual_with(&q),
        };

        if !self.mode.is_time_accurate() && !self.mode.is_adjoint() && residual < self.params.tolerance {
            self.state = VortexState::Converged;
        } else {
            self.state = VortexState::Ready;
        }

        debug!(
            "wake update (wing {}, node {}): movement {:.6e}",
            self.id.wing, self.id.node, residual
        );

        residual
    }

    /// Node displacement needed to align each segment with its edge velocity,
    /// accumulated from the trailing edge. Segments with no usable velocity
    /// keep their current shape.
    fn streamline_offsets(&self, q: &[NVec3]) -> Vec<NVec3> {
        let n = self.nodes.len() - 1;
        let mut offset = vec![NVec3::zeros(); n + 1];
        offset[0] = self.te_node.xyz - self.nodes[0].xyz;

        for i in 1..=n {
            let segment = self.nodes[i].xyz - self.nodes[i - 1].xyz;
            let speed = q[i - 1].norm();
            let aligned = if speed > TINY_SPEED {
                (self.s[i] - self.s[i - 1]) * q[i - 1] / speed
            } else {
                segment
            };
            offset[i] = offset[i - 1] + (aligned - segment);
        }

        offset
    }

    fn relax_to_streamline(&mut self, q: &[NVec3], relax: f64) -> f64 {
        let mut offset = self.streamline_offsets(q);
        if self.params.wake_damping {
            smooth_wake(&mut offset);
        }

        let mut movement: f64 = 0.0;
        for (node, d) in self.nodes.iter_mut().zip(offset.iter()) {
            let step = relax * d;
            node.xyz += step;
            movement = movement.max(step.norm());
        }

        self.rebuild_levels(true);
        movement
    }

    fn convect_nodes(&mut self, q: &[NVec3], time_step: f64) -> f64 {
        let n = self.nodes.len() - 1;

        // node velocities from the adjacent edge velocities
        let node_velocity = |k: usize| -> NVec3 {
            if k == 0 {
                q[0]
            } else if k == n {
                q[n - 1]
            } else {
                0.5 * (q[k - 1] + q[k])
            }
        };

        let old: Vec<NVec3> = self.nodes.iter().map(|nd| nd.xyz).collect();
        let mut movement: f64 = 0.0;

        for i in (1..=n).rev() {
            let x = old[i - 1] + time_step * node_velocity(i - 1);
            movement = movement.max((x - old[i]).norm());
            self.nodes[i].xyz = x;
        }
        self.nodes[0].xyz = self.te_node.xyz;
        movement = movement.max((self.nodes[0].xyz - old[0]).norm());

        self.rebuild_levels(true);
        movement
    }

    /// Cap the edge speed at `velocity_limit * Vinf` and keep a minimum
    /// downstream component so the wake cannot run upstream
    pub fn limit_velocity(&self, q: &mut NVec3) {
        if self.vinf <= TINY_SPEED {
            return;
        }

        let max_speed = self.params.velocity_limit * self.vinf;
        let speed = q.norm();
        if speed > max_speed {
            *q *= max_speed / speed;
        }

        let downstream = self.free_stream / self.vinf;
        let along = q.dot(&downstream);
        let min_along = MIN_DOWNSTREAM_FRACTION * self.vinf;
        if along < min_along {
            *q += (min_along - along) * downstream;
        }
    }

    // =========================================================================================
    // Unsteady convection
    // =========================================================================================

    /// Carry circulation packets one time step downstream.
    ///
    /// - `Implicit`: every packet moves exactly one sub-vortex.
    /// - `Explicit`: every packet moves `|q| * dt` along the wake, with the
    ///   circulation resampled by linear interpolation in arc length.
    ///
    /// The trailing-edge value `gamma[0]` is left for the outer solve to set.
    ///
    /// # Panics
    /// If the analysis mode is not time accurate.
    pub fn convect_wake_vorticity(&mut self, convect: ConvectType) {
        self.assert_set_up();
        let Some(dt) = self.mode.time_step() else {
            panic!("vorticity convection requires a time-accurate analysis mode");
        };

        match convect {
            ConvectType::Implicit => shift_downstream(&mut self.gamma),
            ConvectType::Explicit => {
                let shifts = self.packet_shifts(dt);
                self.gamma = self.resample_along_wake(&self.gamma, &shifts);
            }
        }

        self.current_time_step += 1;
        self.rebuild_levels(false);
    }

    /// Age every packet by one time step, moving ages with the packets the
    /// same way the mode's convect type moves circulation
    pub fn update_wake_age(&mut self) {
        self.assert_set_up();
        let (dt, convect) = match self.mode {
            AnalysisMode::TimeAccurate { time_step, convect } | AnalysisMode::Rotor { time_step, convect, .. } => {
                (time_step, convect)
            }
            _ => panic!("wake age requires a time-accurate analysis mode"),
        };

        match convect {
            ConvectType::Implicit => shift_downstream(&mut self.wake_age),
            ConvectType::Explicit => {
                let shifts = self.packet_shifts(dt);
                self.wake_age = self.resample_along_wake(&self.wake_age, &shifts);
            }
        }
        for age in self.wake_age.iter_mut().skip(1) {
            *age += dt;
        }
        self.wake_age[0] = 0.0;

        self.rebuild_levels(false);
    }

    /// Age of fine sub-vortex `i`
    pub fn wake_age(&self, i: usize) -> f64 {
        self.wake_age[i]
    }

    /// Distance each packet travels in one step, from the finest edge velocities
    fn packet_shifts(&self, dt: f64) -> Vec<f64> {
        let n = self.nodes.len() - 1;
        let q = &self.edge_velocity[0];
        (0..=n).map(|i| q[i.min(n - 1)].norm() * dt).collect()
    }

    /// Value of `values` seen by each packet after moving `shifts[i]` downstream
    fn resample_along_wake(&self, values: &[f64], shifts: &[f64]) -> Vec<f64> {
        let n = self.nodes.len() - 1;

        // packet stations: sub-vortex mid-points, infinite segment at the last node
        let mut station = Vec::with_capacity(n + 1);
        let mut arc = 0.0;
        for e in &self.levels[0] {
            station.push(arc + 0.5 * e.length);
            arc += e.length;
        }
        station.push(arc);

        (0..=n)
            .map(|i| {
                let upstream = station[i] - shifts[i];
                interpolate(&station, values, upstream)
            })
            .collect()
    }

    // =========================================================================================
    // Checkpoint / rollback
    // =========================================================================================

    /// Save the wake shape, circulation history, wake age and time index
    pub fn save_vortex_state(&mut self) {
        self.assert_set_up();
        self.save_shape();
        self.gamma_saved.clone_from(&self.gamma);
        self.wake_age_saved.clone_from(&self.wake_age);
        self.saved_time_step = Some(self.current_time_step);
        self.state = VortexState::Checkpointed;
    }

    /// Save only the wake shape. A later restore keeps the current
    /// circulation history.
    pub fn save_wake_shape_state(&mut self) {
        self.assert_set_up();
        self.save_shape();
        self.saved_time_step = None;
        self.state = VortexState::Checkpointed;
    }

    fn save_shape(&mut self) {
        self.te_node.save();
        self.nodes.iter_mut().for_each(WakeNode::save);
        self.has_shape_checkpoint = true;
    }

    /// Restore the last checkpoint exactly: node positions, and circulation
    /// history if the last save was [`TrailingVortex::save_vortex_state`]. Coarse levels
    /// are re-derived from the restored finest level.
    ///
    /// # Panics
    /// If nothing was saved.
    pub fn restore_wake_shape_state(&mut self) {
        self.assert_set_up();
        assert!(self.has_shape_checkpoint, "restore requested before any wake state was saved");

        self.te_node.restore();
        self.nodes.iter_mut().for_each(WakeNode::restore);
        if let Some(step) = self.saved_time_step {
            self.gamma.clone_from(&self.gamma_saved);
            self.wake_age.clone_from(&self.wake_age_saved);
            self.current_time_step = step;
        }

        self.rebuild_levels(true);
        self.state = VortexState::Ready;
    }

    // =========================================================================================
    // Geometry motion
    // =========================================================================================

    /// Rigidly move the whole filament: `x <- O + R (x - O) + T`
    pub fn update_geometry_location(&mut self, translation: &NVec3, origin: &NVec3, rotation: &UnitQuaternion<f64>) {
        self.assert_set_up();
        self.te_node.xyz = rigid_motion(&self.te_node.xyz, translation, origin, rotation);
        for node in self.nodes.iter_mut() {
            node.xyz = rigid_motion(&node.xyz, translation, origin, rotation);
        }
        self.infinity_node = rigid_motion(&self.infinity_node, translation, origin, rotation);
        self.infinity_dir = rotation * self.infinity_dir;
        self.rebuild_levels(true);
    }

    /// Move only the trailing-edge node; the rest of the wake stays in place
    pub fn update_trailing_edge_geometry_location(
        &mut self,
        translation: &NVec3,
        origin: &NVec3,
        rotation: &UnitQuaternion<f64>,
    ) {
        let te = rigid_motion(&self.te_node.xyz, translation, origin, rotation);
        self.update_trailing_edge_location(te);
    }

    /// Put the trailing-edge node at `te`
    pub fn update_trailing_edge_location(&mut self, te: NVec3) {
        self.assert_set_up();
        self.te_node.xyz = te;
        self.nodes[0].xyz = te;
        self.rebuild_levels(true);
    }

    // =========================================================================================
    // Adjoint support
    // =========================================================================================

    /// Move the trailing-edge node for an adjoint evaluation and refresh the
    /// wake residuals, keeping every array the same shape
    pub fn update_geometry_location_for_adjoint_solve(&mut self, te: NVec3) {
        self.update_trailing_edge_location(te);
        self.compute_wake_residual();
    }

    /// Streamline residual from the current edge velocities
    pub fn compute_wake_residual(&mut self) -> f64 {
        self.assert_set_up();
        let q = self.edge_velocity[0].clone();
        self.compute_wake_residual_with(&q)
    }

    fn compute_wake_residual_with(&mut self, q: &[NVec3]) -> f64 {
        let offset = self.streamline_offsets(q);
        let mut largest: f64 = 0.0;
        for (i, r) in self.residual.iter_mut().enumerate() {
            // node i + 1 must move by offset to sit on its streamline
            *r = -offset[i + 1];
            largest = largest.max(r.norm());
        }
        largest
    }

    /// Nodes carrying residual equations: every fine node but the TE
    pub fn number_of_wake_residual_nodes(&self) -> usize {
        self.residual.len()
    }

    /// Number the x/y/z residual equations of nodes `1..=N` consecutively
    /// from `first`; returns the next free equation number
    pub fn number_wake_equations(&mut self, first: usize) -> usize {
        let mut next = first;
        for eq in self.equation_numbers.iter_mut() {
            *eq = [next, next + 1, next + 2];
            next += 3;
        }
        next
    }

    /// x/y/z residual of wake node `i` (`1..=N`)
    pub fn wake_residual(&self, i: usize) -> NVec3 {
        self.residual[i - 1]
    }

    /// Global x/y/z equation numbers of wake node `i` (`1..=N`)
    pub fn wake_residual_equation_numbers(&self, i: usize) -> [usize; 3] {
        self.equation_numbers[i - 1]
    }

    // =========================================================================================
    // Accessors
    // =========================================================================================

    fn assert_set_up(&self) {
        assert!(
            self.state != VortexState::Uninitialized,
            "trailing vortex used before setup"
        );
    }

    pub fn id(&self) -> VortexId {
        self.id
    }

    pub fn state(&self) -> VortexState {
        self.state
    }

    pub fn is_set_up(&self) -> bool {
        self.state != VortexState::Uninitialized
    }

    pub fn params(&self) -> &WakeParameters {
        &self.params
    }

    pub fn mode(&self) -> &AnalysisMode {
        &self.mode
    }

    pub fn set_mode(&mut self, mode: AnalysisMode) {
        self.mode = mode;
    }

    /// Position of fine wake node `i` (`0` is the trailing edge)
    pub fn wake_node(&self, i: usize) -> NVec3 {
        self.nodes[i].xyz
    }

    /// Move fine wake node `i` (`1..=N`)
    pub fn set_wake_node(&mut self, i: usize, xyz: NVec3) {
        self.assert_set_up();
        assert!(i >= 1, "node 0 is the trailing edge, use update_trailing_edge_location");
        self.nodes[i].xyz = xyz;
        self.rebuild_levels(true);
    }

    /// Number of fine wake nodes, `N + 1`
    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn te_node(&self) -> NVec3 {
        self.te_node.xyz
    }

    /// The point standing in for infinity given at setup (moved rigidly)
    pub fn infinity_node(&self) -> NVec3 {
        self.infinity_node
    }

    pub fn far_dist(&self) -> f64 {
        self.far_dist
    }

    /// Arc-length station of fine node `i` at setup
    pub fn s(&self, i: usize) -> f64 {
        self.s[i]
    }

    /// Centroid of fine sub-vortex `i`
    pub fn xyz_c(&self, i: usize) -> NVec3 {
        self.levels[0][i].centroid
    }

    pub fn sigma(&self) -> f64 {
        self.params.sigma
    }

    pub fn core_size(&self) -> f64 {
        self.params.core_size
    }

    pub fn wake_relax(&self) -> f64 {
        self.params.wake_relax
    }

    pub fn set_wake_relax(&mut self, relax: f64) {
        self.params.wake_relax = relax;
    }

    pub fn far_away_ratio(&self) -> f64 {
        self.params.far_away_ratio
    }

    pub fn s_over_b(&self) -> f64 {
        self.s_over_b
    }

    pub fn set_s_over_b(&mut self, s_over_b: f64) {
        self.s_over_b = s_over_b;
    }

    pub fn free_stream_velocity(&self) -> NVec3 {
        self.free_stream
    }

    /// Unit free-stream direction, zero for a still free stream
    pub fn free_stream_direction(&self) -> NVec3 {
        if self.vinf > 0.0 {
            self.free_stream / self.vinf
        } else {
            NVec3::zeros()
        }
    }

    pub fn vinf(&self) -> f64 {
        self.vinf
    }

    pub fn set_free_stream(&mut self, velocity: NVec3) {
        self.free_stream = velocity;
        self.vinf = velocity.norm();
    }

    pub fn current_time_step(&self) -> usize {
        self.current_time_step
    }

    pub fn evaluate(&self) -> bool {
        self.evaluate
    }

    pub fn set_evaluate(&mut self, evaluate: bool) {
        self.evaluate = evaluate;
    }
}

impl VelocitySource for TrailingVortex {
    fn velocity(&self, p: &NVec3) -> NVec3 {
        self.induced_velocity(p)
    }
}

// helpers ===========================================================================

/// `O + R (x - O) + T`, written as a displacement so identity motions leave
/// `x` bit-for-bit unchanged
pub fn rigid_motion(x: &NVec3, translation: &NVec3, origin: &NVec3, rotation: &UnitQuaternion<f64>) -> NVec3 {
    let arm = x - origin;
    x + ((rotation * arm - arm) + translation)
}

/// 3-point filter on interior edge velocities
fn smooth_velocity(q: &mut [NVec3]) {
    if q.len() < 3 {
        return;
    }
    let old = q.to_vec();
    for i in 1..q.len() - 1 {
        q[i] = 0.25 * old[i - 1] + 0.5 * old[i] + 0.25 * old[i + 1];
    }
}

/// 3-point filter on interior node offsets; the TE and last node keep theirs
fn smooth_wake(offset: &mut [NVec3]) {
    smooth_velocity(offset);
}

/// `values[i] <- values[i - 1]` for `i >= 1`, `values[0]` unchanged
fn shift_downstream(values: &mut [f64]) {
    for i in (1..values.len()).rev() {
        values[i] = values[i - 1];
    }
}

/// Piecewise-linear interpolation of `values` over increasing `stations`,
/// clamped at both ends
fn interpolate(stations: &[f64], values: &[f64], s: f64) -> f64 {
    let last = stations.len() - 1;
    if s <= stations[0] {
        return values[0];
    }
    if s >= stations[last] {
        return values[last];
    }

    let k = stations.partition_point(|&x| x <= s).max(1);
    let (s0, s1) = (stations[k - 1], stations[k]);
    let t = if s1 > s0 { (s - s0) / (s1 - s0) } else { 0.0 };
    values[k - 1] + t * (values[k] - values[k - 1])
}
