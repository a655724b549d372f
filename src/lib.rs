pub mod error;
pub mod simulation;
pub mod mesh;
pub mod io;
pub mod configuration;
pub mod benchmark;

pub use error::{GridIssue, WakeError, WakeResult};

pub use simulation::states::{NVec3, VortexEdge, VortexId, WakeNode};
pub use simulation::params::{WakeParameters, DEFAULT_FAR_AWAY_RATIO};
pub use simulation::mode::{AnalysisMode, ConvectType, RotorKinematics, WakeStep};
pub use simulation::velocity::{segment_velocity, semi_infinite_velocity, OnsetFlow, VelocitySet, VelocitySource};
pub use simulation::search::SearchTree;
pub use simulation::trailing_vortex::{TrailingVortex, VelocitySample, VortexState};
pub use simulation::integrator::{SolveReport, WakeSolver};
pub use simulation::scenario::Scenario;

pub use mesh::elements::{Edge, ElementList, KuttaNode, Loop, Node, Surface, SurfaceKind};
pub use mesh::grid::Grid;
pub use mesh::gradient::Gradient;
pub use mesh::merge_sort::{merge_sort_by_key, sort_edges};

pub use configuration::config::{AnalysisConfig, FreeStreamConfig, MeshConfig, ScenarioConfig, WakeConfig};

pub use benchmark::benchmark::{bench_induced_velocity, bench_search};
