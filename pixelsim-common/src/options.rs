use serde::{Deserialize, Serialize};

/// Explicit Runge-Kutta scheme used by the pixel integrator.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelIntegratorType {
    /// Forwards Euler, fixed step, no error estimate.
    Rk101,
    /// Heun with embedded forwards Euler.
    #[default]
    Rk212,
    /// Shu-Osher 3rd order with embedded Heun.
    Rk323,
    /// 5 stage 4th order with embedded 3rd order.
    Rk435,
}

/// Maximum local integration error allowed per accepted step.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct PixelIntegratorError {
    #[serde(default = "default_max_abs_err")]
    pub abs: f64,
    #[serde(default = "default_max_rel_err")]
    pub rel: f64,
}

impl Default for PixelIntegratorError {
    fn default() -> Self {
        PixelIntegratorError {
            abs: default_max_abs_err(),
            rel: default_max_rel_err(),
        }
    }
}

/// Options bundle for the pixel integrator, loaded from the `[integrator]` table.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PixelOptions {
    #[serde(default)]
    pub integrator: PixelIntegratorType,
    #[serde(default)]
    pub max_err: PixelIntegratorError,
    #[serde(default = "default_max_timestep")]
    pub max_timestep: f64,
    #[serde(default)]
    pub enable_multithreading: bool,
    /// Worker threads for the parallel backend, 0 means all available.
    #[serde(default)]
    pub max_threads: usize,
}

impl Default for PixelOptions {
    fn default() -> Self {
        PixelOptions {
            integrator: PixelIntegratorType::default(),
            max_err: PixelIntegratorError::default(),
            max_timestep: default_max_timestep(),
            enable_multithreading: false,
            max_threads: 0,
        }
    }
}

fn default_max_abs_err() -> f64 {
    f64::MAX
}

fn default_max_rel_err() -> f64 {
    0.005
}

fn default_max_timestep() -> f64 {
    f64::MAX
}
