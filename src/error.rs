//! Error types for the wake solver
//!
//! - [`WakeError`]: recoverable failures (record stream I/O, bad config)
//! - [`GridIssue`]: degenerate geometry found while deriving a grid; these
//!   are collected and reported, the offending element is flagged and the
//!   rest of the mesh is still usable
//!
//! Misuse of the API (querying a vortex before setup, solving a gradient
//! system that was never sized) panics instead of returning an error.

use thiserror::Error;

/// Result alias used across the crate
pub type WakeResult<T> = Result<T, WakeError>;

/// Recoverable wake solver errors
#[derive(Error, Debug)]
pub enum WakeError {
    /// Underlying read/write failure on a record stream
    #[error("record stream i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record tag did not match what the reader expected
    #[error("unexpected record tag {found:?}, expected {expected:?}")]
    RecordTag {
        expected: [u8; 4],
        found: [u8; 4],
    },

    /// Record body disagrees with the object it is read into
    #[error("record size mismatch for {what}: object has {expected}, record has {found}")]
    RecordMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// Record header declares a body the stream cannot hold
    #[error("record {tag:?} declares {declared} body bytes, stream has {available}")]
    RecordLength {
        tag: [u8; 4],
        declared: u64,
        available: u64,
    },

    /// Scenario or parameter value outside its valid range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Degenerate geometry detected during grid derivation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridIssue {
    /// A loop references the same node twice, or two of its nodes coincide
    #[error("loop {loop_id} has a zero-length edge between nodes {node1} and {node2}")]
    ZeroLengthEdge {
        loop_id: usize,
        node1: usize,
        node2: usize,
    },

    /// Normal magnitude below tolerance, area is effectively zero
    #[error("loop {loop_id} is degenerate: normal magnitude {magnitude:.3e}")]
    ZeroNormal {
        loop_id: usize,
        magnitude: f64,
    },

    /// Two loops traverse a shared edge in the same direction
    #[error("loops {loop1} and {loop2} have inconsistent orientation across edge {edge}")]
    InconsistentOrientation {
        edge: usize,
        loop1: usize,
        loop2: usize,
    },

    /// More than two loops share one edge
    #[error("edge between nodes {node1} and {node2} is shared by more than two loops")]
    NonManifoldEdge {
        node1: usize,
        node2: usize,
    },
}
