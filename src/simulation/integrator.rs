//! Wake iteration driver
//!
//! `WakeSolver` owns a grid and one trailing vortex per kutta node and runs
//! the outer loop around them:
//! - steady rollup with checkpoint / rollback / relaxation halving,
//! - time-accurate (and rotor) stepping,
//! - adjoint residual evaluation.
//!
//! Every update is split in two phases. The evaluation phase is read-only
//! and runs in parallel over target filaments; the update phase mutates
//! node positions only after every evaluation has finished.

use log::{debug, info, warn};
use nalgebra::UnitQuaternion;
use rayon::prelude::*;

use super::mode::AnalysisMode;
use super::params::WakeParameters;
use super::states::{NVec3, VortexId};
use super::trailing_vortex::{TrailingVortex, INFINITY_FACTOR};
use super::velocity::{OnsetFlow, VelocitySet, VelocitySource};
use crate::mesh::grid::Grid;

/// Relaxation factor below which rollbacks stop halving it
pub const MIN_WAKE_RELAX: f64 = 1.0e-3;

/// Summary of a steady rollup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
    pub rollbacks: usize,
}

pub struct WakeSolver<'a> {
    pub grid: Grid<'a>,
    pub vortices: Vec<TrailingVortex>,
    pub params: WakeParameters,
    pub mode: AnalysisMode,
    pub free_stream: NVec3,
    pub time: f64,
    onset: OnsetFlow,
}

impl<'a> WakeSolver<'a> {
    /// Shed one trailing vortex from every kutta node of `grid`, straight
    /// downstream, carrying the node's shed circulation
    pub fn new(mut grid: Grid<'a>, params: WakeParameters, mode: AnalysisMode, free_stream: NVec3) -> Self {
        grid.set_core_size(params.effective_core());
        grid.update_edge_circulation();

        let direction = wake_direction(&mode, &free_stream);
        let mut vortices = Vec::with_capacity(grid.number_of_kutta_nodes());

        for (k, kn) in grid.kutta_nodes().iter().enumerate() {
            let edge = grid
                .edges()
                .iter()
                .position(|e| e.trailing_edge && e.touches(kn.node))
                .unwrap_or(0);
            let id = VortexId { wing: kn.surface, edge, node: kn.node, component: kn.component };

            let mut tv = TrailingVortex::new(id, params.clone(), mode);
            tv.set_free_stream(free_stream);
            tv.set_s_over_b(kn.s_over_b);
            tv.setup(
                params.num_sub_vortices,
                params.far_dist,
                kn.trailing_edge,
                kn.trailing_edge + direction * (INFINITY_FACTOR * params.far_dist),
            );
            tv.set_gamma(grid.kutta_node_circulation(k));
            vortices.push(tv);
        }

        info!(
            "wake solver: {} trailing vortices, {} sub-vortices each, mode {:?}",
            vortices.len(),
            params.num_sub_vortices,
            mode
        );

        let onset = OnsetFlow { free_stream, mode };
        Self { grid, vortices, params, mode, free_stream, time: 0.0, onset }
    }

    // =========================================================================================
    // Evaluation
    // =========================================================================================

    /// Onset flow, surface lattice and every filament as one source set
    pub fn velocity_set(&self) -> VelocitySet<'_> {
        let mut set = VelocitySet::new().with(&self.onset).with(&self.grid);
        for tv in &self.vortices {
            set = set.with(tv);
        }
        set
    }

    /// Total velocity at `p`, relative to the blade in rotor mode
    pub fn velocity_at(&self, p: &NVec3) -> NVec3 {
        self.velocity_set().velocity_at(p)
    }

    /// Total velocity at many points, in parallel
    pub fn velocities_at(&self, points: &[NVec3]) -> Vec<NVec3> {
        let mut out = vec![NVec3::zeros(); points.len()];
        self.velocity_set().accumulate_velocities(points, &mut out);
        out
    }

    /// Fill every filament's edge velocity accumulators.
    ///
    /// Each source filament is evaluated on the coarsest target sub-vortex
    /// that is far enough from it, and the result is prolongated down to the
    /// finest level. Free stream and surface lattice act on the finest level.
    /// Velocities are inertial: rotor blades are turned by
    /// [`WakeSolver::advance_time_step`], not by a frame velocity.
    pub fn evaluate_edge_velocities(&mut self) {
        let sources = &self.vortices;
        let grid = &self.grid;
        let onset = &self.onset;
        let ratio = self.params.far_away_ratio;

        // read-only phase: one target filament per task
        let velocities: Vec<Vec<Vec<NVec3>>> = sources
            .par_iter()
            .map(|target| {
                let mut v: Vec<Vec<NVec3>> = (1..=target.number_of_levels())
                    .map(|l| vec![NVec3::zeros(); target.number_of_sub_vortices_at(l)])
                    .collect();

                let top = target.number_of_levels();
                for source in sources.iter().filter(|s| s.evaluate()) {
                    for j in 0..target.number_of_sub_vortices_at(top) {
                        accumulate_source(source, target, top, j, ratio, &mut v);
                    }
                }

                for (i, q) in v[0].iter_mut().enumerate() {
                    let c = target.xyz_c(i);
                    *q += onset.convection_velocity() + grid.velocity(&c);
                }

                v
            })
            .collect();

        // barrier: write back and prolongate
        for (tv, v) in self.vortices.iter_mut().zip(velocities) {
            tv.zero_edge_velocities();
            for (l, level) in v.into_iter().enumerate() {
                for (i, q) in level.into_iter().enumerate() {
                    *tv.edge_velocity_mut(l + 1, i) = q;
                }
            }
            tv.prolongate_edge_velocities();
        }
    }

    /// Move every filament with its accumulated edge velocities; returns
    /// the largest movement
    pub fn update_wake(&mut self) -> f64 {
        self.vortices
            .par_iter_mut()
            .map(|tv| tv.update_wake_location())
            .reduce(|| 0.0, f64::max)
    }

    // =========================================================================================
    // Steady rollup
    // =========================================================================================

    /// Relax the wake toward a force-free shape.
    ///
    /// Each iteration checkpoints every filament before updating. If the
    /// movement grows compared with the last accepted iteration, the wake is
    /// restored and the relaxation factor halved.
    pub fn solve_steady(&mut self) -> SolveReport {
        assert!(
            matches!(self.mode, AnalysisMode::Steady),
            "steady rollup requested in {:?} mode",
            self.mode
        );

        let mut report = SolveReport { iterations: 0, residual: f64::INFINITY, converged: false, rollbacks: 0 };
        let mut previous = f64::INFINITY;

        for iteration in 1..=self.params.max_iterations {
            report.iterations = iteration;

            // checkpoint at the iteration boundary
            self.vortices.iter_mut().for_each(TrailingVortex::save_vortex_state);

            self.evaluate_edge_velocities();
            let residual = self.update_wake();

            if residual > previous && self.params.wake_relax > MIN_WAKE_RELAX {
                // diverging: roll back and retry with a smaller step
                self.vortices.iter_mut().for_each(TrailingVortex::restore_wake_shape_state);
                self.set_wake_relax(0.5 * self.params.wake_relax);
                report.rollbacks += 1;
                warn!(
                    "wake iteration {iteration}: movement grew to {residual:.4e}, relaxation reduced to {:.4}",
                    self.params.wake_relax
                );
                continue;
            }

            debug!("wake iteration {iteration}: movement {residual:.6e}");
            previous = residual;
            report.residual = residual;

            if residual < self.params.tolerance {
                report.converged = true;
                break;
            }
        }

        if report.converged {
            info!("wake converged in {} iterations, movement {:.3e}", report.iterations, report.residual);
        } else {
            warn!("wake not converged after {} iterations, movement {:.3e}", report.iterations, report.residual);
        }

        report
    }

    pub fn set_wake_relax(&mut self, relax: f64) {
        self.params.wake_relax = relax;
        self.vortices.iter_mut().for_each(|tv| tv.set_wake_relax(relax));
    }

    // =========================================================================================
    // Time accurate
    // =========================================================================================

    /// Advance one physical time step.
    ///
    /// 1. Evaluate edge velocities and convect the wake nodes. The newest
    ///    node is left where the trailing edge was.
    /// 2. Convect circulation packets, age the wake.
    /// 3. Rotor mode: rotate the blades and move the trailing edges.
    /// 4. Shed the current trailing-edge circulation.
    ///
    /// Returns the largest node movement.
    pub fn advance_time_step(&mut self) -> f64 {
        let (time_step, convect) = match self.mode {
            AnalysisMode::TimeAccurate { time_step, convect } | AnalysisMode::Rotor { time_step, convect, .. } => {
                (time_step, convect)
            }
            _ => panic!("time step requested in {:?} mode", self.mode),
        };

        self.evaluate_edge_velocities();
        let movement = self.update_wake();

        for tv in self.vortices.iter_mut() {
            tv.convect_wake_vorticity(convect);
            tv.update_wake_age();
        }

        if let Some(rotor) = self.mode.rotor().copied() {
            let angle = rotor.omega().norm() * time_step;
            let rotation = UnitQuaternion::from_scaled_axis(rotor.thrust_axis.normalize() * angle);
            let group = vec![true; self.grid.surfaces().iter().map(|s| s.component + 1).max().unwrap_or(0)];
            self.grid.update_geometry_location(&NVec3::zeros(), &rotor.origin, &rotation, &group);
            self.sync_trailing_edges();
        }

        self.time += time_step;
        self.shed_circulation();

        debug!("t = {:.4}: wake movement {movement:.6e}", self.time);
        movement
    }

    /// Push the grid's kutta-node circulation into the filaments
    pub fn shed_circulation(&mut self) {
        self.grid.update_edge_circulation();
        for (k, tv) in self.vortices.iter_mut().enumerate() {
            tv.set_gamma(self.grid.kutta_node_circulation(k));
        }
    }

    /// Move the filament trailing-edge nodes onto the grid's kutta nodes
    pub fn sync_trailing_edges(&mut self) {
        for (k, tv) in self.vortices.iter_mut().enumerate() {
            tv.update_trailing_edge_location(self.grid.kutta_node(k).trailing_edge);
        }
    }

    /// Rigidly move the grid components selected by `group` and every
    /// filament shed from them
    pub fn update_geometry_location(
        &mut self,
        translation: &NVec3,
        origin: &NVec3,
        rotation: &UnitQuaternion<f64>,
        group: &[bool],
    ) {
        self.grid.update_geometry_location(translation, origin, rotation, group);
        for tv in self.vortices.iter_mut() {
            if group.get(tv.id().component).copied().unwrap_or(false) {
                tv.update_geometry_location(translation, origin, rotation);
            }
        }
    }

    // =========================================================================================
    // Adjoint
    // =========================================================================================

    /// Number the wake equations of every filament after `first` and fill
    /// their residuals. Returns the next free equation number and the
    /// largest residual.
    pub fn assemble_wake_residuals(&mut self, first: usize) -> (usize, f64) {
        assert!(self.mode.is_adjoint(), "wake residuals requested in {:?} mode", self.mode);

        self.evaluate_edge_velocities();

        let mut next = first;
        let mut largest: f64 = 0.0;
        for tv in self.vortices.iter_mut() {
            next = tv.number_wake_equations(next);
            largest = largest.max(tv.update_wake_location());
        }

        (next, largest)
    }
}

// helpers ===========================================================================

/// Target-side agglomeration of one source filament: a target sub-vortex
/// far enough from the source takes the source velocity at its centroid,
/// otherwise its two children are tried.
fn accumulate_source(
    source: &TrailingVortex,
    target: &TrailingVortex,
    level: usize,
    j: usize,
    ratio: f64,
    v: &mut [Vec<NVec3>],
) {
    let edge = target.vortex_edge(level, j);

    if level == 1 || source.distance_to(&edge.centroid) >= ratio * edge.length {
        v[level - 1][j] += source.induced_velocity(&edge.centroid);
        return;
    }

    accumulate_source(source, target, level - 1, 2 * j, ratio, v);
    accumulate_source(source, target, level - 1, 2 * j + 1, ratio, v);
}

/// Initial wake direction: downstream with the free stream, against the
/// thrust for a hovering rotor, else +x
fn wake_direction(mode: &AnalysisMode, free_stream: &NVec3) -> NVec3 {
    if free_stream.norm() > 0.0 {
        return free_stream.normalize();
    }
    match mode.rotor() {
        Some(rotor) if rotor.thrust_axis.norm() > 0.0 => -rotor.thrust_axis.normalize(),
        _ => NVec3::x(),
    }
}
