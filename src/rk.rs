//! Low-storage Runge-Kutta schemes in Shu-Osher form, and the embedded error model.
//!
//! Each stage of a scheme performs, elementwise,
//!
//! ```text
//! s2 += delta * c
//! c   = g1 * c + g2 * s2 + g3 * s3 + beta * dt * dc/dt(c)
//! ```
//!
//! with `s3` holding the concentration at the start of the step. After the last stage,
//! `s2 = c_factor * c + s2_factor * s2 + s3_factor * s3` is the embedded lower order
//! solution used for the error estimate.

use pixelsim_common::PixelIntegratorType;

/// Coefficients of a single stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RkStage {
    pub g1: f64,
    pub g2: f64,
    pub g3: f64,
    pub beta: f64,
    pub delta: f64,
}

const fn stage(g1: f64, g2: f64, g3: f64, beta: f64, delta: f64) -> RkStage {
    RkStage { g1, g2, g3, beta, delta }
}

/// Weights producing the embedded solution in `s2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RkFinalise {
    pub c_factor: f64,
    pub s2_factor: f64,
    pub s3_factor: f64,
}

// RK2(1)2: Heun with embedded forwards Euler, eq (2.15) of
// https://doi.org/10.1016/0021-9991(88)90177-5
const HEUN: [RkStage; 2] = [
    stage(1.0, 0.0, 0.0, 1.0, 0.0),
    stage(0.5, 0.0, 0.5, 0.5, 1.0),
];

// RK3(2)3: Shu-Osher with embedded Heun, eq (2.18) of
// https://doi.org/10.1016/0021-9991(88)90177-5
const RK323: [RkStage; 3] = [
    stage(1.0, 0.0, 0.0, 1.0, 0.0),
    stage(0.25, 0.0, 0.75, 0.25, 0.0),
    stage(2.0 / 3.0, 0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0),
];

// RK4(3)5: 3S* algorithm 6 / table 6 of https://doi.org/10.1016/j.jcp.2009.11.006
const RK435: [RkStage; 5] = [
    stage(0.0, 1.0, 0.0, 0.075152045700771, 1.0),
    stage(-0.497531095840104, 1.384996869124138, 0.0, 0.211361016946069, 0.081252332929194),
    stage(1.010070514199942, 3.878155713328178, 0.0, 1.100713347634329, -1.083849060586449),
    stage(-3.196559004608766, -2.324512951813145, 1.642598936063715, 0.728537814675568, -1.096110881845602),
    stage(1.717835630267259, -0.514633322274467, 0.188295940828347, 0.393172889823198, 2.859440022030827),
];

/// The two extra `delta` coefficients of RK4(3)5 weighting `c` and `s3` in the embedded solution.
const RK435_DELTA_FINAL: [f64; 2] = [-0.655568367959557, -0.194421504490852];

/// Integration scheme, fixed for the lifetime of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RkScheme {
    /// RK1(0)1
    Euler,
    /// RK2(1)2
    Heun,
    /// RK3(2)3
    Rk323,
    /// RK4(3)5
    Rk435,
}

impl From<PixelIntegratorType> for RkScheme {
    fn from(t: PixelIntegratorType) -> Self {
        match t {
            PixelIntegratorType::Rk101 => RkScheme::Euler,
            PixelIntegratorType::Rk212 => RkScheme::Heun,
            PixelIntegratorType::Rk323 => RkScheme::Rk323,
            PixelIntegratorType::Rk435 => RkScheme::Rk435,
        }
    }
}

impl RkScheme {
    /// Stage coefficients. Empty for forwards Euler, which has its own kernel.
    pub fn stages(self) -> &'static [RkStage] {
        match self {
            RkScheme::Euler => &[],
            RkScheme::Heun => &HEUN,
            RkScheme::Rk323 => &RK323,
            RkScheme::Rk435 => &RK435,
        }
    }

    pub fn finalise(self) -> RkFinalise {
        match self {
            RkScheme::Euler | RkScheme::Heun => RkFinalise { c_factor: 0.0, s2_factor: 1.0, s3_factor: 0.0 },
            RkScheme::Rk323 => RkFinalise { c_factor: 0.0, s2_factor: 2.0, s3_factor: -1.0 },
            RkScheme::Rk435 => {
                let sum: f64 = RK435.iter().map(|s| s.delta).sum::<f64>() + RK435_DELTA_FINAL.iter().sum::<f64>();
                let norm = 1.0 / sum;
                RkFinalise {
                    c_factor: norm * RK435_DELTA_FINAL[0],
                    s2_factor: norm,
                    s3_factor: norm * RK435_DELTA_FINAL[1],
                }
            }
        }
    }

    /// Exponent applied to the error ratio when choosing the next step: 1 / order.
    pub fn error_power(self) -> f64 {
        match self {
            RkScheme::Euler => 1.0,
            RkScheme::Heun => 1.0 / 2.0,
            RkScheme::Rk323 => 1.0 / 3.0,
            RkScheme::Rk435 => 1.0 / 4.0,
        }
    }

    /// Whether the scheme has an embedded error estimate and adapts its step size.
    pub fn is_adaptive(self) -> bool {
        self != RkScheme::Euler
    }
}

/// Embedded error estimate of one step: max absolute and max relative difference
/// between the solution and the lower order solution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RkError {
    pub abs: f64,
    pub rel: f64,
}

impl RkError {
    /// Componentwise maximum.
    pub fn max(self, other: RkError) -> RkError {
        RkError {
            abs: self.abs.max(other.abs),
            rel: self.rel.max(other.rel),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.abs.is_finite() && self.rel.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Applies a scheme to the scalar ODE dc/dt = -k c, returning (solution, embedded solution).
    fn integrate_scalar(scheme: RkScheme, c0: f64, k: f64, dt: f64) -> (f64, f64) {
        let (mut c, mut s2, s3) = (c0, 0.0, c0);
        for st in scheme.stages() {
            let dcdt = -k * c;
            s2 += st.delta * c;
            c = st.g1 * c + st.g2 * s2 + st.g3 * s3 + st.beta * dt * dcdt;
        }
        let f = scheme.finalise();
        (c, f.c_factor * c + f.s2_factor * s2 + f.s3_factor * s3)
    }

    #[test]
    fn schemes_are_consistent() {
        // each scheme must integrate dc/dt = -c accurately over one small step
        for scheme in [RkScheme::Heun, RkScheme::Rk323, RkScheme::Rk435] {
            let dt = 1e-2;
            let (c, low) = integrate_scalar(scheme, 1.0, 1.0, dt);
            let exact = (-dt).exp();
            assert!((c - exact).abs() < 1e-6, "{:?}: {} vs {}", scheme, c, exact);
            assert!((low - exact).abs() < 1e-4, "{:?}: embedded {} vs {}", scheme, low, exact);
        }
    }

    #[test]
    fn heun_embedded_solution_is_forwards_euler() {
        let (c, low) = integrate_scalar(RkScheme::Heun, 1.0, 2.0, 0.1);
        assert!((low - 0.8).abs() < 1e-14);
        // Heun: c0 + dt/2 (f(c0) + f(c0 + dt f(c0)))
        assert!((c - (1.0 + 0.05 * (-2.0 - 1.6))).abs() < 1e-14);
    }

    #[test]
    fn rk323_embedded_solution_is_heun() {
        let (_, low) = integrate_scalar(RkScheme::Rk323, 1.0, 2.0, 0.1);
        let (heun, _) = integrate_scalar(RkScheme::Heun, 1.0, 2.0, 0.1);
        assert!((low - heun).abs() < 1e-14);
    }

    #[test]
    fn error_estimate_shrinks_with_expected_order() {
        for (scheme, order) in [(RkScheme::Heun, 2), (RkScheme::Rk323, 3), (RkScheme::Rk435, 4)] {
            let err = |dt: f64| {
                let (c, low) = integrate_scalar(scheme, 1.0, 1.0, dt);
                (c - low).abs()
            };
            // local error of the embedded (order - 1) method scales as dt^order
            let ratio = err(0.02) / err(0.01);
            let expected = 2f64.powi(order);
            assert!(
                (ratio / expected - 1.0).abs() < 0.15,
                "{:?}: ratio {} expected {}",
                scheme,
                ratio,
                expected
            );
        }
    }

    #[test]
    fn error_powers() {
        assert_eq!(RkScheme::from(PixelIntegratorType::Rk101).error_power(), 1.0);
        assert_eq!(RkScheme::Heun.error_power(), 0.5);
        assert!((RkScheme::Rk435.error_power() - 0.25).abs() < 1e-15);
        assert!(!RkScheme::Euler.is_adaptive());
        assert!(RkScheme::Rk323.is_adaptive());
    }
}
