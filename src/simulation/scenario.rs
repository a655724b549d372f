//! Build fully-initialized wake scenarios from configuration
//!
//! Takes a `ScenarioConfig` (YAML-facing) and produces the runtime bundle
//! `Scenario` containing:
//! - wake parameters (`WakeParameters`)
//! - analysis mode (`AnalysisMode`)
//! - free-stream velocity vector
//! - the derived surface grid (`Grid`, edges, normals, kutta nodes)
//!
//! The scenario is then turned into a `WakeSolver` by the binary.

use log::info;

use super::integrator::WakeSolver;
use super::mode::{AnalysisMode, ConvectType, RotorKinematics};
use super::params::{WakeParameters, DEFAULT_FAR_AWAY_RATIO};
use super::states::NVec3;
use crate::configuration::config::{
    AnalysisConfig, ConvectConfig, FreeStreamConfig, MeshConfig, ScenarioConfig, SurfaceKindConfig,
};
use crate::error::{WakeError, WakeResult};
use crate::mesh::elements::{Loop, Node, Surface, SurfaceKind};
use crate::mesh::grid::Grid;

/// Runtime bundle constructed from a [`ScenarioConfig`]
pub struct Scenario {
    pub params: WakeParameters,
    pub mode: AnalysisMode,
    pub free_stream: NVec3,
    pub grid: Grid<'static>,
    pub num_steps: usize, // time steps for time-accurate modes, 0 otherwise
}

impl Scenario {
    pub fn build_scenario(cfg: ScenarioConfig) -> WakeResult<Self> {
        // Parameters (runtime) from WakeConfig
        let w_cfg = cfg.wake;
        let defaults = WakeParameters::default();
        let params = WakeParameters {
            num_sub_vortices: w_cfg.num_sub_vortices,
            far_dist: w_cfg.far_dist,
            far_away_ratio: w_cfg.far_away_ratio.unwrap_or(DEFAULT_FAR_AWAY_RATIO),
            core_size: w_cfg.core_size.unwrap_or(0.0),
            sigma: w_cfg.sigma,
            core_growth_rate: w_cfg.core_growth_rate.unwrap_or(defaults.core_growth_rate),
            wake_relax: w_cfg.wake_relax,
            tolerance: w_cfg.tolerance,
            max_iterations: w_cfg.max_iterations,
            wake_damping: w_cfg.wake_damping.unwrap_or(defaults.wake_damping),
            velocity_limit: w_cfg.velocity_limit.unwrap_or(defaults.velocity_limit),
        };
        params.validate()?;

        // Analysis mode from AnalysisConfig
        let (mode, num_steps) = match cfg.analysis {
            AnalysisConfig::Steady => (AnalysisMode::Steady, 0),
            AnalysisConfig::TimeAccurate { time_step, num_steps, convect } => (
                AnalysisMode::TimeAccurate { time_step, convect: convect_type(convect) },
                num_steps,
            ),
            AnalysisConfig::Rotor { time_step, num_steps, convect, rpm, origin, thrust_axis } => {
                let rotor = RotorKinematics {
                    rpm,
                    origin: vec3(&origin, "rotor origin")?,
                    thrust_axis: vec3(&thrust_axis, "rotor thrust axis")?.normalize(),
                };
                (
                    AnalysisMode::Rotor { rotor, time_step, convect: convect_type(convect) },
                    num_steps,
                )
            }
            AnalysisConfig::Adjoint => (AnalysisMode::Adjoint, 0),
        };
        if let Some(dt) = mode.time_step() {
            if dt <= 0.0 {
                return Err(WakeError::InvalidConfig(format!("time_step must be positive, got {dt}")));
            }
        }

        let free_stream = free_stream_velocity(&cfg.free_stream);
        let grid = build_grid(&cfg.mesh)?;

        info!(
            "scenario: {} nodes, {} loops, {} kutta nodes, Vinf = {:.3}",
            grid.number_of_nodes(),
            grid.number_of_loops(),
            grid.number_of_kutta_nodes(),
            free_stream.norm()
        );

        Ok(Self { params, mode, free_stream, grid, num_steps })
    }

    /// Shed the wake and hand everything to the iteration driver
    pub fn into_solver(self) -> WakeSolver<'static> {
        WakeSolver::new(self.grid, self.params, self.mode, self.free_stream)
    }
}

/// Free stream from speed, angle of attack and sideslip
pub fn free_stream_velocity(cfg: &FreeStreamConfig) -> NVec3 {
    let (alpha, beta) = (cfg.alpha_deg.to_radians(), cfg.beta_deg.to_radians());
    cfg.speed * NVec3::new(alpha.cos() * beta.cos(), -beta.sin(), alpha.sin() * beta.cos())
}

/// Fill and derive a grid from an explicit mesh description
pub fn build_grid(cfg: &MeshConfig) -> WakeResult<Grid<'static>> {
    let mut grid = Grid::new("mesh");

    for s in &cfg.surfaces {
        grid.add_surface(Surface {
            component: s.component,
            kind: match s.kind {
                SurfaceKindConfig::Wing => SurfaceKind::Wing,
                SurfaceKindConfig::Body => SurfaceKind::Body,
            },
            periodic: s.periodic,
        });
    }

    // Nodes: map config rows -> runtime `Node`, component from the first loop using it
    grid.size_node_list(cfg.nodes.len());
    for (i, row) in cfg.nodes.iter().enumerate() {
        grid.nodes_mut()[i] = Node::new(vec3(row, "node")?, 0);
    }

    grid.size_loop_list(cfg.loops.len());
    for (l, lc) in cfg.loops.iter().enumerate() {
        let Some(surface) = cfg.surfaces.get(lc.surface) else {
            return Err(WakeError::InvalidConfig(format!("loop {l} references missing surface {}", lc.surface)));
        };
        if lc.nodes.len() < 3 || lc.nodes.iter().any(|&n| n >= cfg.nodes.len()) {
            return Err(WakeError::InvalidConfig(format!("loop {l} has an invalid node list {:?}", lc.nodes)));
        }
        for &n in lc.nodes.iter().rev() {
            grid.nodes_mut()[n].component = surface.component;
        }
        grid.loops_mut()[l] = Loop::new(lc.nodes.clone(), lc.surface, lc.gamma);
    }

    // Derivation: edges, loop geometry, trailing edge, kutta nodes
    grid.create_tri_edges();
    grid.calculate_tri_normals_and_centroids();
    for &[a, b] in &cfg.trailing_edge {
        if !grid.mark_trailing_edge(a, b) {
            return Err(WakeError::InvalidConfig(format!("trailing edge {a}-{b} is not an edge of the mesh")));
        }
    }
    grid.find_kutta_nodes();
    grid.update_edge_circulation();

    Ok(grid)
}

fn convect_type(cfg: ConvectConfig) -> ConvectType {
    match cfg {
        ConvectConfig::Implicit => ConvectType::Implicit,
        ConvectConfig::Explicit => ConvectType::Explicit,
    }
}

fn vec3(v: &[f64], what: &str) -> WakeResult<NVec3> {
    match v {
        [x, y, z] => Ok(NVec3::new(*x, *y, *z)),
        _ => Err(WakeError::InvalidConfig(format!("{what} needs 3 components, got {}", v.len()))),
    }
}
