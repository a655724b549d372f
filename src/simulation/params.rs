//! Numerical parameters for the trailing wake
//!
//! `WakeParameters` holds the settings every trailing vortex is built with:
//! - discretization (`num_sub_vortices`, `far_dist`),
//! - agglomeration level selection (`far_away_ratio`),
//! - regularization (`core_size`, `sigma`, `core_growth_rate`),
//! - rollup control (`wake_relax`, `tolerance`, `max_iterations`, damping).
//!
//! The value is passed into each filament at construction, so two solvers in
//! one process can run with different policies.

use crate::error::{WakeError, WakeResult};

/// Default far-away ratio: a level is used once the field point is at least
/// this many sub-vortex lengths away from the filament
pub const DEFAULT_FAR_AWAY_RATIO: f64 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub struct WakeParameters {
    pub num_sub_vortices: usize, // finest-level sub-vortices, power of two
    pub far_dist: f64, // length of the adapted wake before the infinite segment
    pub far_away_ratio: f64, // distance / sub-vortex length needed to coarsen
    pub core_size: f64, // vortex core radius at the trailing edge
    pub sigma: f64, // half spacing between wakes at the trailing edge
    pub core_growth_rate: f64, // core^2 growth per unit wake age (damping)
    pub wake_relax: f64, // steady pseudo-time relaxation factor
    pub tolerance: f64, // wake movement below which the shape is converged
    pub max_iterations: usize, // rollup iterations before giving up
    pub wake_damping: bool, // smooth wake shape and velocities
    pub velocity_limit: f64, // max edge speed as a multiple of Vinf
}

impl Default for WakeParameters {
    fn default() -> Self {
        Self {
            num_sub_vortices: 64,
            far_dist: 10.0,
            far_away_ratio: DEFAULT_FAR_AWAY_RATIO,
            core_size: 0.0,
            sigma: 0.01,
            core_growth_rate: 0.0,
            wake_relax: 0.5,
            tolerance: 1.0e-6,
            max_iterations: 20,
            wake_damping: true,
            velocity_limit: 2.0,
        }
    }
}

impl WakeParameters {
    /// Check ranges once up front instead of asserting deep in the solver
    pub fn validate(&self) -> WakeResult<()> {
        if !self.num_sub_vortices.is_power_of_two() {
            return Err(WakeError::InvalidConfig(format!(
                "num_sub_vortices must be a power of two, got {}",
                self.num_sub_vortices
            )));
        }
        if self.far_dist <= 0.0 {
            return Err(WakeError::InvalidConfig(format!("far_dist must be positive, got {}", self.far_dist)));
        }
        if self.far_away_ratio <= 0.0 {
            return Err(WakeError::InvalidConfig(format!(
                "far_away_ratio must be positive, got {}",
                self.far_away_ratio
            )));
        }
        if self.core_size < 0.0 || self.sigma < 0.0 || self.core_growth_rate < 0.0 {
            return Err(WakeError::InvalidConfig("core sizes must be non-negative".to_string()));
        }
        if !(self.wake_relax > 0.0 && self.wake_relax <= 1.0) {
            return Err(WakeError::InvalidConfig(format!(
                "wake_relax must lie in (0, 1], got {}",
                self.wake_relax
            )));
        }
        Ok(())
    }

    /// Regularization radius at the trailing edge: the core size if one is
    /// set, otherwise the wake half spacing
    pub fn effective_core(&self) -> f64 {
        if self.core_size > 0.0 {
            self.core_size
        } else {
            self.sigma
        }
    }
}
