//! Configuration types for loading wake scenarios from YAML.
//!
//! This module defines a thin, `serde`-deserializable representation of a
//! wake scenario. A scenario consists of:
//!
//! - [`WakeConfig`]       – wake discretization and rollup parameters
//! - [`FreeStreamConfig`] – onset flow magnitude and direction
//! - [`AnalysisConfig`]   – steady / time-accurate / rotor / adjoint kinematics
//! - [`MeshConfig`]       – explicit surface mesh with its trailing edge
//! - [`ScenarioConfig`]   – top-level wrapper used to load a scenario from YAML
//!
//! # YAML format
//! A minimal steady scenario matching these types:
//!
//! ```yaml
//! wake:
//!   num_sub_vortices: 32    # power of two
//!   far_dist: 10.0          # adapted wake length
//!   far_away_ratio: 4.0     # optional, distance / sub-vortex length to coarsen
//!   sigma: 0.05             # wake half spacing, used as core when core_size is 0
//!   wake_relax: 0.5
//!   tolerance: 1.0e-5
//!   max_iterations: 20
//!
//! free_stream:
//!   speed: 1.0
//!   alpha_deg: 5.0          # angle of attack
//!   beta_deg: 0.0           # sideslip
//!
//! analysis:
//!   mode: "steady"          # or "time_accurate", "rotor", "adjoint"
//!
//! mesh:
//!   nodes:
//!     - [0.0, 0.0, 0.0]
//!     - [1.0, 0.0, 0.0]
//!     - [1.0, 1.0, 0.0]
//!     - [0.0, 1.0, 0.0]
//!   surfaces:
//!     - component: 0
//!       kind: "wing"
//!   loops:
//!     - nodes: [0, 1, 2, 3]
//!       surface: 0
//!       gamma: 1.0
//!   trailing_edge:
//!     - [1, 2]
//! ```
//!
//! The scenario builder then maps this configuration into the runtime grid,
//! parameters and solver.

use serde::Deserialize;

/// How circulation packets are convected in time-accurate runs
/// `convect: "implicit"` or `convect: "explicit"`
#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub enum ConvectConfig {
    #[serde(rename = "implicit")] // one sub-vortex per step, wake spacing Vinf * dt
    #[default]
    Implicit,

    #[serde(rename = "explicit")] // local |q| * dt, resampled along the wake
    Explicit,
}

/// Wake discretization and rollup parameters
#[derive(Deserialize, Debug, Clone)]
pub struct WakeConfig {
    pub num_sub_vortices: usize, // finest-level sub-vortices per filament, power of two
    pub far_dist: f64, // length of the adapted wake
    pub far_away_ratio: Option<f64>, // level selection ratio, default 4
    pub core_size: Option<f64>, // explicit core radius, 0 -> use sigma
    pub sigma: f64, // half spacing between neighboring wakes
    pub wake_relax: f64, // steady relaxation factor
    pub tolerance: f64, // movement below which the wake is converged
    pub max_iterations: usize, // steady rollup iterations
    pub wake_damping: Option<bool>, // smoothing and core growth, default on
    pub core_growth_rate: Option<f64>, // core^2 growth per unit wake age
    pub velocity_limit: Option<f64>, // max edge speed / Vinf
}

/// Onset flow
#[derive(Deserialize, Debug, Clone)]
pub struct FreeStreamConfig {
    pub speed: f64, // Vinf
    pub alpha_deg: f64, // angle of attack, positive nose up about +y
    pub beta_deg: f64, // sideslip, positive wind from the right
}

/// Analysis mode and its kinematics
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "mode")]
pub enum AnalysisConfig {
    #[serde(rename = "steady")]
    Steady,

    #[serde(rename = "time_accurate")]
    TimeAccurate {
        time_step: f64,
        num_steps: usize,
        #[serde(default)]
        convect: ConvectConfig,
    },

    #[serde(rename = "rotor")]
    Rotor {
        time_step: f64,
        num_steps: usize,
        #[serde(default)]
        convect: ConvectConfig,
        rpm: f64,
        origin: Vec<f64>, // rotor hub
        thrust_axis: Vec<f64>, // thrust direction
    },

    #[serde(rename = "adjoint")]
    Adjoint,
}

/// Surface type: only wings shed trailing vortices
#[derive(Deserialize, Debug, Clone, Copy)]
pub enum SurfaceKindConfig {
    #[serde(rename = "wing")]
    Wing,

    #[serde(rename = "body")]
    Body,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SurfaceConfig {
    pub component: usize, // component id, used by group motions
    pub kind: SurfaceKindConfig,
    #[serde(default)]
    pub periodic: bool, // closed trailing edge (nacelle)
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoopConfig {
    pub nodes: Vec<usize>, // polygon, counter-clockwise seen from the normal side
    pub surface: usize,
    #[serde(default)]
    pub gamma: f64, // ring-vortex circulation
}

/// Explicit surface mesh; meshing itself happens elsewhere
#[derive(Deserialize, Debug, Clone)]
pub struct MeshConfig {
    pub nodes: Vec<Vec<f64>>,
    pub surfaces: Vec<SurfaceConfig>,
    pub loops: Vec<LoopConfig>,
    pub trailing_edge: Vec<[usize; 2]>, // node pairs of trailing-edge edges
}

/// Top-level scenario configuration loaded from YAML.
#[derive(Deserialize, Debug, Clone)]
pub struct ScenarioConfig {
    pub wake: WakeConfig, // wake parameters shared by every filament
    pub free_stream: FreeStreamConfig, // onset flow
    pub analysis: AnalysisConfig, // analysis mode
    pub mesh: MeshConfig, // surface the wake is shed from
}
