pub mod config;
pub mod options;
pub mod snapshot;
pub mod voxel;

// Re-export key types for easier use by dependent crates
pub use config::{SimulationConfig, GeometryConfig, CompartmentLabel, SpeciesConfig, ReactionConfig, TimingConfig, InitialConditions, OutputConfig};
pub use options::{PixelIntegratorType, PixelIntegratorError, PixelOptions};
pub use snapshot::{AvgMinMax, CompartmentStats, Snapshot};
pub use voxel::{Voxel, Volume, VoxelSize};
