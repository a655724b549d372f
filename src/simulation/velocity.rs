//! Velocity contributors for the wake solver
//!
//! Regularized Biot–Savart kernels for finite and semi-infinite vortex
//! segments, and a [`VelocitySet`] that sums independent velocity sources
//! (onset flow, surface lattice, trailing vortices) at a field point.

use std::f64::consts::PI;

use rayon::prelude::*;

use super::mode::AnalysisMode;
use super::states::NVec3;

/// Distances below this are treated as coincident points
const TINY: f64 = 1.0e-14;

/// Velocity induced at `p` by a straight segment `a -> b` of circulation `gamma`.
///
/// The classic `(r1 x r2) / |r1 x r2|^2` factor is regularized by adding
/// `(core * |r0|)^2` to the denominator, which is the same as replacing the
/// perpendicular distance `h^2` by `h^2 + core^2`. Outside the core the
/// relative deviation from the singular law is `O(core^2 / h^2)`.
pub fn segment_velocity(a: &NVec3, b: &NVec3, gamma: f64, core: f64, p: &NVec3) -> NVec3 {
    if gamma == 0.0 {
        return NVec3::zeros();
    }

    let r0 = b - a;
    let r1 = p - a;
    let r2 = p - b;

    let r1n = r1.norm();
    let r2n = r2.norm();
    if r1n < TINY || r2n < TINY {
        return NVec3::zeros();
    }

    let cross = r1.cross(&r2);
    let denom = cross.norm_squared() + core * core * r0.norm_squared();
    if denom < TINY * TINY {
        return NVec3::zeros();
    }

    // Gamma/(4 pi) * r0 . (r1/|r1| - r2/|r2|) / denom
    let coef = gamma / (4.0 * PI) * r0.dot(&(r1 / r1n - r2 / r2n)) / denom;
    coef * cross
}

/// Velocity induced at `p` by a semi-infinite segment starting at `a` and
/// running to infinity along the unit vector `dir`.
///
/// This is the limit of [`segment_velocity`] with the far end at infinity:
/// `Gamma/(4 pi) * (1 + cos a) * (dir x r1) / (h^2 + core^2)`.
pub fn semi_infinite_velocity(a: &NVec3, dir: &NVec3, gamma: f64, core: f64, p: &NVec3) -> NVec3 {
    if gamma == 0.0 {
        return NVec3::zeros();
    }

    let r1 = p - a;
    let r1n = r1.norm();
    if r1n < TINY {
        return NVec3::zeros();
    }

    let cross = dir.cross(&r1);
    let denom = cross.norm_squared() + core * core;
    if denom < TINY * TINY {
        return NVec3::zeros();
    }

    let coef = gamma / (4.0 * PI) * (1.0 + dir.dot(&r1) / r1n) / denom;
    coef * cross
}

/// Anything that induces a velocity at a field point
///
/// Implementations must be read-only so a set of sources can be evaluated
/// from many threads at once.
pub trait VelocitySource {
    fn velocity(&self, p: &NVec3) -> NVec3;
}

/// Onset flow: free stream plus blade-frame velocity in rotor analyses
#[derive(Debug, Clone, Copy)]
pub struct OnsetFlow {
    pub free_stream: NVec3,
    pub mode: AnalysisMode,
}

impl OnsetFlow {
    /// Velocity that carries wake nodes. The grid is moved in the inertial
    /// frame, so shed nodes only see the free stream here.
    pub fn convection_velocity(&self) -> NVec3 {
        self.free_stream
    }
}

impl VelocitySource for OnsetFlow {
    fn velocity(&self, p: &NVec3) -> NVec3 {
        self.mode.onset_velocity(&self.free_stream, p)
    }
}

/// Collection of velocity sources summed at a field point
pub struct VelocitySet<'a> {
    terms: Vec<&'a (dyn VelocitySource + Sync)>,
}

impl<'a> Default for VelocitySet<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> VelocitySet<'a> {
    /// Create an empty set
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Add a velocity source
    pub fn with(mut self, term: &'a (dyn VelocitySource + Sync)) -> Self {
        self.terms.push(term);
        self
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Sum of all contributions at `p`
    pub fn velocity_at(&self, p: &NVec3) -> NVec3 {
        self.terms.iter().fold(NVec3::zeros(), |acc, term| acc + term.velocity(p))
    }

    /// Evaluate at every point of `points` into `out`, in parallel
    /// - `out[i]` is overwritten with the total velocity at `points[i]`
    pub fn accumulate_velocities(&self, points: &[NVec3], out: &mut [NVec3]) {
        out.par_iter_mut().zip(points.par_iter()).for_each(|(q, p)| {
            *q = self.velocity_at(p);
        });
    }
}
