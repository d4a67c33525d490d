//! Explicit Runge-Kutta integration of reaction-diffusion models on voxel grids.
//!
//! A [`Model`](model::Model) describes compartments (sets of voxels holding species that
//! react and diffuse) and membranes (voxel pairs straddling two compartments, where
//! flux reactions act). [`PixelSim`](pixel_sim::PixelSim) integrates the concentrations
//! forwards in time with one of the schemes in [`rk`].

pub mod error;
pub mod geometry;
pub mod model;
pub mod parallel;
pub mod pixel_sim;
pub mod reactions;
pub mod rk;
pub mod sim_compartment;
pub mod sim_membrane;
pub mod steady_state;
pub mod units;

pub use error::{PixelSimError, Result};
pub use model::Model;
pub use pixel_sim::{PixelSim, StopHandle};
pub use pixelsim_common::{PixelIntegratorError, PixelIntegratorType, PixelOptions};
pub use steady_state::SteadyStateRunner;
