//! Runs a simulation until dc/dt stops changing.

use crate::error::{PixelSimError, Result};
use crate::pixel_sim::PixelSim;
use log::{debug, info, trace};
use std::time::Instant;

pub struct SteadyStateRunner {
    sim: PixelSim,
    stop_tolerance: f64,
    last_change: f64,
}

impl SteadyStateRunner {
    /// Steady state is reached once no element of dc/dt changes by more than
    /// `stop_tolerance` over one step.
    pub fn new(sim: PixelSim, stop_tolerance: f64) -> Self {
        SteadyStateRunner {
            sim,
            stop_tolerance,
            last_change: f64::MAX,
        }
    }

    pub fn sim(&self) -> &PixelSim {
        &self.sim
    }

    pub fn into_inner(self) -> PixelSim {
        self.sim
    }

    /// Max absolute change of dc/dt over the last step.
    pub fn last_change(&self) -> f64 {
        self.last_change
    }

    fn dcdt_snapshot(&mut self) -> Vec<f64> {
        self.sim.calculate_dcdt();
        self.sim
            .compartments()
            .iter()
            .flat_map(|c| c.dcdt().iter().copied())
            .collect()
    }

    /// Takes steps of at most `dt_max` until steady state, returning the number of steps.
    pub fn run(&mut self, dt_max: f64, timeout_ms: f64) -> Result<usize> {
        let timer = Instant::now();
        let stop = self.sim.stop_handle();
        let mut steps = 0;
        loop {
            let before = self.dcdt_snapshot();
            self.sim.run_step(dt_max, 0.0).map_err(|e| e.with_steps(steps))?;
            steps += 1;
            let after = self.dcdt_snapshot();
            self.last_change = before
                .iter()
                .zip(&after)
                .map(|(b, a)| (a - b).abs())
                .fold(0.0, f64::max);
            trace!("step {}: max dc/dt change {:e}", steps, self.last_change);
            if self.last_change <= self.stop_tolerance {
                info!("steady state reached after {} steps", steps);
                return Ok(steps);
            }
            if timeout_ms >= 0.0 && timer.elapsed().as_secs_f64() * 1000.0 >= timeout_ms {
                debug!("timeout of {} ms reached after {} steps", timeout_ms, steps);
                stop.request_stop();
            }
            if stop.is_stop_requested() {
                stop.reset();
                return Err(PixelSimError::Cancelled { steps });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Compartment;
    use crate::model::{CompartmentDef, Model, SpeciesDef};
    use crate::reactions::{ReactionDef, ReactionTerms};
    use pixelsim_common::{PixelIntegratorType, PixelOptions, Volume, VoxelSize};
    use std::sync::Arc;

    fn production_decay() -> PixelSim {
        let geometry = Compartment::from_mask("c", Volume::new(2, 1, 1), VoxelSize::default(), &[true; 2]).unwrap();
        let model = Model::new(
            vec![CompartmentDef {
                geometry: Arc::new(geometry),
                species: vec![SpeciesDef::new("u", 0.1, 0.0)],
                reactions: ReactionTerms::Expressions(vec![ReactionDef::new("r", "1 - u", &[("u", 1.0)])]),
            }],
            vec![],
        );
        let options = PixelOptions {
            integrator: PixelIntegratorType::Rk323,
            ..PixelOptions::default()
        };
        PixelSim::new(&model, &options).unwrap()
    }

    #[test]
    fn converges_to_fixed_point() {
        let mut runner = SteadyStateRunner::new(production_decay(), 1e-8);
        let steps = runner.run(0.5, -1.0).unwrap();
        assert!(steps > 0);
        assert!(runner.last_change() <= 1e-8);
        for c in runner.sim().concentrations(0) {
            assert!((c - 1.0).abs() < 1e-4, "c = {}", c);
        }
    }

    #[test]
    fn zero_timeout_cancels() {
        let mut runner = SteadyStateRunner::new(production_decay(), 0.0);
        let err = runner.run(0.5, 0.0).unwrap_err();
        assert_eq!(err, PixelSimError::Cancelled { steps: 1 });
    }
}
