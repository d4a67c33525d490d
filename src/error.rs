use thiserror::Error;

/// Everything that can stop a [`PixelSim`](crate::pixel_sim::PixelSim) from being built or from
/// reaching the requested simulation time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PixelSimError {
    /// Inconsistent geometry, species or membrane references.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A reaction rate expression could not be compiled.
    #[error("invalid reaction expression '{expression}': {message}")]
    Expression { expression: String, message: String },
    /// Adaptive step size collapsed below a tiny fraction of the requested step.
    #[error("Failed to solve model to required accuracy. The largest relative integration error comes from species '{species}'")]
    ConvergenceFailure {
        steps: usize,
        species: String,
        /// Voxel indices (within the compartment of `species`) with the largest relative error.
        voxels: Vec<usize>,
    },
    /// Stop requested or timeout elapsed.
    #[error("Simulation stopped early")]
    Cancelled { steps: usize },
    /// The embedded error estimate was NaN or infinite.
    #[error("Integration produced a non-finite error estimate")]
    NonFinite { steps: usize },
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl PixelSimError {
    /// Accepted steps completed before a run-time error, 0 for configuration errors.
    pub fn steps(&self) -> usize {
        match self {
            PixelSimError::ConvergenceFailure { steps, .. }
            | PixelSimError::Cancelled { steps }
            | PixelSimError::NonFinite { steps } => *steps,
            _ => 0,
        }
    }

    /// A cancelled run leaves the state valid for resumption with another `run`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PixelSimError::Cancelled { .. })
    }

    pub(crate) fn with_steps(self, n: usize) -> Self {
        match self {
            PixelSimError::ConvergenceFailure { species, voxels, .. } => {
                PixelSimError::ConvergenceFailure { steps: n, species, voxels }
            }
            PixelSimError::Cancelled { .. } => PixelSimError::Cancelled { steps: n },
            PixelSimError::NonFinite { .. } => PixelSimError::NonFinite { steps: n },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PixelSimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_reported_text() {
        let err = PixelSimError::Cancelled { steps: 3 };
        assert_eq!(err.to_string(), "Simulation stopped early");
        assert!(err.is_recoverable());
        assert_eq!(err.steps(), 3);

        let err = PixelSimError::ConvergenceFailure { steps: 0, species: "A".into(), voxels: vec![] }
            .with_steps(7);
        assert!(err.to_string().starts_with("Failed to solve model to required accuracy"));
        assert_eq!(err.steps(), 7);
        assert!(!err.is_recoverable());
    }
}
