//! Core state types for the trailing wake.
//!
//! - `NVec3`: 3D vector alias used everywhere
//! - `WakeNode`: a wake polyline node with its checkpoint copy
//! - `VortexEdge`: one straight vortex segment with circulation and core
//! - `VortexId`: which wing / edge / node / component a filament belongs to

use nalgebra::Vector3;

use super::velocity::{segment_velocity, semi_infinite_velocity};

pub type NVec3 = Vector3<f64>;

/// Identity of a trailing vortex: the surface it is shed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VortexId {
    pub wing: usize, // wing surface the kutta node is on
    pub edge: usize, // trailing-edge edge attached to this vortex
    pub node: usize, // kutta node the vortex is shed from
    pub component: usize, // component id of the wing
}

/// Node of a wake polyline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeNode {
    pub xyz: NVec3, // current position
    pub saved: NVec3, // position at the last checkpoint
}

impl WakeNode {
    pub fn new(xyz: NVec3) -> Self {
        Self { xyz, saved: xyz }
    }

    pub fn save(&mut self) {
        self.saved = self.xyz;
    }

    pub fn restore(&mut self) {
        self.xyz = self.saved;
    }
}

/// A straight vortex segment from `node1` to `node2`.
///
/// Direction is defined by node order: swapping the nodes negates the
/// induced velocity. Derived quantities (`centroid`, `direction`, `length`)
/// are refreshed by [`VortexEdge::set_nodes`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VortexEdge {
    pub node1: NVec3,
    pub node2: NVec3,
    pub gamma: f64, // circulation
    pub core: f64, // regularization radius
    pub centroid: NVec3,
    pub direction: NVec3, // unit vector node1 -> node2, zero if degenerate
    pub length: f64,
}

impl Default for VortexEdge {
    fn default() -> Self {
        Self::new(NVec3::zeros(), NVec3::zeros(), 0.0, 0.0)
    }
}

impl VortexEdge {
    pub fn new(node1: NVec3, node2: NVec3, gamma: f64, core: f64) -> Self {
        let mut edge = Self {
            node1,
            node2,
            gamma,
            core,
            centroid: NVec3::zeros(),
            direction: NVec3::zeros(),
            length: 0.0,
        };
        edge.set_nodes(node1, node2);
        edge
    }

    /// Move the end points in place and refresh the derived data
    pub fn set_nodes(&mut self, node1: NVec3, node2: NVec3) {
        self.node1 = node1;
        self.node2 = node2;
        let r0 = node2 - node1;
        self.length = r0.norm();
        self.centroid = 0.5 * (node1 + node2);
        self.direction = if self.length > 0.0 { r0 / self.length } else { NVec3::zeros() };
    }

    /// Velocity induced at `p`, using `core` unless an override is given
    pub fn induced_velocity(&self, p: &NVec3, core_override: Option<f64>) -> NVec3 {
        let core = core_override.unwrap_or(self.core);
        segment_velocity(&self.node1, &self.node2, self.gamma, core, p)
    }

    /// Velocity induced at `p` treating `node2` as lying at infinity along
    /// `direction`
    pub fn induced_velocity_semi_infinite(&self, p: &NVec3, core_override: Option<f64>) -> NVec3 {
        let core = core_override.unwrap_or(self.core);
        semi_infinite_velocity(&self.node1, &self.direction, self.gamma, core, p)
    }
}
