pub mod states;
pub mod params;
pub mod mode;
pub mod velocity;
pub mod search;
pub mod trailing_vortex;
pub mod integrator;
pub mod scenario;
