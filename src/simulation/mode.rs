//! Analysis mode carried alongside every trailing vortex
//!
//! The steady, time-accurate, rotor and adjoint paths share one geometric
//! state; what differs is how the onset velocity is formed and how a wake
//! update moves (or does not move) the nodes. Both are pure functions of the
//! mode, see [`AnalysisMode::onset_velocity`] and [`AnalysisMode::wake_step`].

use std::f64::consts::PI;

use super::states::NVec3;

/// How far a circulation packet moves downstream per time step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvectType {
    /// Exactly one sub-vortex per step (index shift); assumes the wake was
    /// discretized with spacing `Vinf * dt`
    #[default]
    Implicit,
    /// By the local convection distance `|q| * dt`, resampled along arc length
    Explicit,
}

/// Rigid rotor kinematics for blade-fixed analyses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotorKinematics {
    pub rpm: f64, // blade rpm
    pub origin: NVec3, // rotor hub
    pub thrust_axis: NVec3, // unit thrust direction, rotation is right-handed about it
}

impl RotorKinematics {
    /// Angular velocity vector (rad/s)
    pub fn omega(&self) -> NVec3 {
        self.rpm * 2.0 * PI / 60.0 * self.thrust_axis
    }

    /// Apparent velocity of the air at `p` seen from the rotating blade frame
    pub fn frame_velocity(&self, p: &NVec3) -> NVec3 {
        -self.omega().cross(&(p - self.origin))
    }
}

/// Analysis mode of a wake
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AnalysisMode {
    /// Steady rollup: nodes relax toward the local streamline
    #[default]
    Steady,
    /// Time-accurate convection with a physical time step
    TimeAccurate { time_step: f64, convect: ConvectType },
    /// Time-accurate convection in a rotating blade frame
    Rotor { rotor: RotorKinematics, time_step: f64, convect: ConvectType },
    /// Wake nodes are unknowns of a global adjoint system; updates expose
    /// residuals and leave the geometry untouched
    Adjoint,
}

/// What one wake update does to the node positions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeStep {
    /// Move each node toward its streamline target by this fraction
    Relax(f64),
    /// Convect nodes with the local velocity over a physical step
    Convect { time_step: f64, convect: ConvectType },
    /// Only evaluate the streamline residual
    Residual,
}

impl AnalysisMode {
    /// Free stream plus any blade-frame velocity at `p`
    pub fn onset_velocity(&self, free_stream: &NVec3, p: &NVec3) -> NVec3 {
        match self {
            AnalysisMode::Rotor { rotor, .. } => free_stream + rotor.frame_velocity(p),
            _ => *free_stream,
        }
    }

    /// Wake update rule for this mode
    pub fn wake_step(&self, relax: f64) -> WakeStep {
        match *self {
            AnalysisMode::Steady => WakeStep::Relax(relax),
            AnalysisMode::TimeAccurate { time_step, convect } => WakeStep::Convect { time_step, convect },
            AnalysisMode::Rotor { time_step, convect, .. } => WakeStep::Convect { time_step, convect },
            AnalysisMode::Adjoint => WakeStep::Residual,
        }
    }

    /// Physical time step, if the mode is time accurate
    pub fn time_step(&self) -> Option<f64> {
        match *self {
            AnalysisMode::TimeAccurate { time_step, .. } | AnalysisMode::Rotor { time_step, .. } => Some(time_step),
            _ => None,
        }
    }

    pub fn is_time_accurate(&self) -> bool {
        self.time_step().is_some()
    }

    pub fn is_adjoint(&self) -> bool {
        matches!(self, AnalysisMode::Adjoint)
    }

    pub fn rotor(&self) -> Option<&RotorKinematics> {
        match self {
            AnalysisMode::Rotor { rotor, .. } => Some(rotor),
            _ => None,
        }
    }
}
