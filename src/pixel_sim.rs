//! The explicit integrator over all compartments and membranes of a model.

use crate::error::{PixelSimError, Result};
use crate::model::Model;
use crate::parallel::{Executor, ParallelFor};
use crate::rk::{RkError, RkScheme};
use crate::sim_compartment::SimCompartment;
use crate::sim_membrane::{CompartmentId, SimMembrane};
use log::{debug, error, info, trace, warn};
use pixelsim_common::{PixelIntegratorError, PixelOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Guards the relative error denominator against zero concentrations.
const EPSILON: f64 = 1e-14;
/// First trial step of an adaptive integration.
const INITIAL_TIMESTEP: f64 = 1e-7;
/// Runs end once within this fraction of the requested time.
const TIME_TOLERANCE: f64 = 1e-12;
/// Adaptive step shrinks below this fraction of the allowed step: give up.
const MIN_TIMESTEP_RATIO: f64 = 1e-20;
const SAFETY_FACTOR: f64 = 0.95;

/// Shared flag for stopping a running simulation from another thread.
///
/// Checked once per completed step. The flag is cleared when a run stops because of it,
/// so the simulation can be resumed with another `run`.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PixelSim {
    scheme: RkScheme,
    max_err: PixelIntegratorError,
    max_timestep: f64,
    next_timestep: f64,
    max_stable_timestep: f64,
    /// Simulation time reached so far, summed over all runs.
    time: f64,
    executor: Executor,
    compartments: Vec<SimCompartment>,
    membranes: Vec<SimMembrane>,
    discarded_steps: usize,
    last_error: Option<PixelSimError>,
    stop: StopHandle,
}

impl PixelSim {
    /// Sets up the state of every compartment and the membranes that have reactions.
    pub fn new(model: &Model, options: &PixelOptions) -> Result<Self> {
        let scheme = RkScheme::from(options.integrator);
        let executor = Executor::from_options(options)?;
        let vol_over_l3 = model.vol_over_l3();

        let mut compartments = Vec::with_capacity(model.compartments.len());
        for def in &model.compartments {
            let species_ids: Vec<String> = def.species.iter().map(|s| s.id.clone()).collect();
            let reactions = def.reactions.build(&species_ids, 1.0, &model.parameters)?;
            compartments.push(SimCompartment::new(Arc::clone(&def.geometry), &def.species, reactions)?);
        }

        let mut membranes = Vec::new();
        for def in &model.membranes {
            if def.reactions.is_empty() {
                debug!("membrane '{}' has no reactions, skipping", def.geometry.id());
                continue;
            }
            let find = |id: &str| {
                let found = compartments
                    .iter()
                    .position(|c| c.compartment_id() == id)
                    .map(|i| (CompartmentId(i), &compartments[i]));
                if found.is_none() {
                    warn!("membrane '{}': compartment '{}' is not simulated", def.geometry.id(), id);
                }
                found
            };
            let a = find(def.geometry.compartment_a_id());
            let b = find(def.geometry.compartment_b_id());
            membranes.push(SimMembrane::new(
                Arc::clone(&def.geometry),
                a,
                b,
                &def.reactions,
                vol_over_l3,
                &model.parameters,
            )?);
        }

        let max_stable_timestep = compartments
            .iter()
            .map(SimCompartment::max_stable_timestep)
            .fold(f64::MAX, f64::min);
        info!(
            "PixelSim: {:?}, {} compartments, {} membranes, {} threads, max stable timestep {:e}",
            scheme,
            compartments.len(),
            membranes.len(),
            executor.n_threads(),
            max_stable_timestep
        );

        Ok(PixelSim {
            scheme,
            max_err: options.max_err,
            max_timestep: options.max_timestep,
            next_timestep: INITIAL_TIMESTEP,
            max_stable_timestep,
            time: 0.0,
            executor,
            compartments,
            membranes,
            discarded_steps: 0,
            last_error: None,
            stop: StopHandle::default(),
        })
    }

    /// Evaluates dc/dt of every compartment at the current concentrations and time.
    ///
    /// Compartment reactions and diffusion first, then membrane fluxes (one membrane at a
    /// time, since they may share a compartment), then averaging of non-spatial species.
    pub fn calculate_dcdt(&mut self) {
        self.calculate_dcdt_at(self.time);
    }

    fn calculate_dcdt_at(&mut self, time: f64) {
        for comp in self.compartments.iter_mut() {
            comp.evaluate_reactions_and_diffusion(&self.executor, time);
        }
        for membrane in &self.membranes {
            membrane.evaluate_reactions(&mut self.compartments, time);
        }
        for comp in self.compartments.iter_mut() {
            comp.spatially_average_dcdt();
        }
    }

    fn do_rk101(&mut self, dt: f64) {
        self.calculate_dcdt();
        for comp in self.compartments.iter_mut() {
            comp.do_forwards_euler_timestep(&self.executor, dt);
        }
        self.time += dt;
    }

    /// One step of an embedded scheme, leaving the lower order solution in `s2`.
    ///
    /// Each stage is evaluated at its own time, advanced by the same low-storage update as
    /// a concentration with dc/dt = 1. The step isn't committed to `self.time` here.
    fn do_rk_stages(&mut self, dt: f64) {
        for comp in self.compartments.iter_mut() {
            comp.do_rk_init();
        }
        let (mut t, mut t2, t3) = (self.time, 0.0, self.time);
        for stage in self.scheme.stages() {
            self.calculate_dcdt_at(t);
            for comp in self.compartments.iter_mut() {
                comp.do_rk_substep(&self.executor, dt, stage);
            }
            t2 += stage.delta * t;
            t = stage.g1 * t + stage.g2 * t2 + stage.g3 * t3 + stage.beta * dt;
        }
        let finalise = self.scheme.finalise();
        for comp in self.compartments.iter_mut() {
            comp.do_rk_finalise(&self.executor, &finalise);
        }
    }

    fn undo_rk_step(&mut self) {
        for comp in self.compartments.iter_mut() {
            comp.undo_rk_step(&self.executor);
        }
    }

    fn rk_error(&self) -> RkError {
        let mut err = RkError::default();
        for comp in &self.compartments {
            let e = comp.calculate_rk_error(EPSILON);
            if !e.is_finite() {
                return e;
            }
            err = err.max(e);
        }
        err
    }

    /// Takes one accepted adaptive step of at most `dt_max`, retrying with smaller steps
    /// while the error is too large. Returns the step taken.
    fn do_rk_adaptive(&mut self, dt_max: f64) -> Result<f64> {
        let power = self.scheme.error_power();
        loop {
            let dt = self.next_timestep.min(dt_max);
            self.do_rk_stages(dt);
            let err = self.rk_error();
            if !err.is_finite() {
                self.discarded_steps += 1;
                self.undo_rk_step();
                self.next_timestep = 0.5 * dt;
                if self.next_timestep / dt_max < MIN_TIMESTEP_RATIO {
                    error!("non-finite error estimate down to dt = {:e}", dt);
                    return Err(PixelSimError::NonFinite { steps: 0 });
                }
                debug!("non-finite error estimate with dt = {:e}, retrying with half the step", dt);
                continue;
            }
            let err_factor = (self.max_err.abs / err.abs)
                .min(self.max_err.rel / err.rel)
                .powf(power);
            self.next_timestep = (SAFETY_FACTOR * dt * err_factor).min(dt_max);
            trace!(
                "dt = {:e}, err = ({:e}, {:e}), next dt = {:e}",
                dt,
                err.abs,
                err.rel,
                self.next_timestep
            );
            if self.next_timestep / dt_max < MIN_TIMESTEP_RATIO {
                let failure = self.convergence_failure(err);
                error!("{}", failure);
                self.undo_rk_step();
                return Err(failure);
            }
            if err.abs > self.max_err.abs || err.rel > self.max_err.rel {
                self.discarded_steps += 1;
                trace!("discarding step, {} discarded so far", self.discarded_steps);
                self.undo_rk_step();
                continue;
            }
            self.time += dt;
            return Ok(dt);
        }
    }

    fn convergence_failure(&self, err: RkError) -> PixelSimError {
        let worst = self
            .compartments
            .iter()
            .filter(|c| c.calculate_rk_error(EPSILON).rel >= err.rel)
            .find_map(|c| {
                c.largest_relative_error(EPSILON, err.rel)
                    .map(|(s, voxels)| (c.species_names()[s].clone(), voxels))
            });
        let (species, voxels) = worst.unwrap_or_default();
        PixelSimError::ConvergenceFailure { steps: 0, species, voxels }
    }

    /// Takes one step towards `time` from `t_now`, returning its length.
    ///
    /// Forwards Euler steps are limited by the diffusion stability bound, adaptive steps
    /// by the error tolerances.
    pub fn run_step(&mut self, time: f64, t_now: f64) -> Result<f64> {
        let dt_max = self.max_timestep.min(time - t_now);
        if self.scheme.is_adaptive() {
            self.do_rk_adaptive(dt_max)
        } else {
            let dt = dt_max.min(self.max_stable_timestep);
            self.do_rk101(dt);
            Ok(dt)
        }
    }

    /// Integrates forwards by `time`, returning the number of accepted steps.
    ///
    /// A non-negative `timeout_ms` bounds the wall clock time of the run.
    pub fn run(&mut self, time: f64, timeout_ms: f64) -> Result<usize> {
        self.run_with_callback(time, timeout_ms, || false)
    }

    /// As [`run`](Self::run), additionally stopping once `should_stop` returns true.
    pub fn run_with_callback<F: Fn() -> bool>(&mut self, time: f64, timeout_ms: f64, should_stop: F) -> Result<usize> {
        self.last_error = None;
        self.discarded_steps = 0;
        let timer = Instant::now();
        let mut t_now = 0.0;
        let mut steps = 0;
        while t_now + time * TIME_TOLERANCE < time {
            match self.run_step(time, t_now) {
                Ok(dt) => t_now += dt,
                Err(e) => return Err(self.fail(e.with_steps(steps))),
            }
            steps += 1;
            if timeout_ms >= 0.0 && timer.elapsed().as_secs_f64() * 1000.0 >= timeout_ms {
                debug!("timeout of {} ms reached after {} steps", timeout_ms, steps);
                self.stop.request_stop();
            }
            if self.stop.is_stop_requested() || should_stop() {
                self.stop.reset();
                return Err(self.fail(PixelSimError::Cancelled { steps }));
            }
        }
        debug!(
            "t = {:e} integrated using {} steps ({:.1}% discarded) in {:.1} ms",
            time,
            steps,
            100.0 * self.discarded_steps as f64 / (steps + self.discarded_steps).max(1) as f64,
            timer.elapsed().as_secs_f64() * 1000.0
        );
        Ok(steps)
    }

    fn fail(&mut self, e: PixelSimError) -> PixelSimError {
        warn!("run ended early: {}", e);
        self.last_error = Some(e.clone());
        e
    }

    /// Handle for stopping a run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Message of the error that ended the last run, empty if it completed.
    pub fn error_message(&self) -> String {
        self.last_error.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&PixelSimError> {
        self.last_error.as_ref()
    }

    /// Steps rejected by the error control during the last run.
    pub fn discarded_steps(&self) -> usize {
        self.discarded_steps
    }

    pub fn next_timestep(&self) -> f64 {
        self.next_timestep
    }

    /// Overrides the trial length of the next adaptive step.
    pub fn set_next_timestep(&mut self, dt: f64) {
        self.next_timestep = dt;
    }

    pub fn max_stable_timestep(&self) -> f64 {
        self.max_stable_timestep
    }

    /// Simulation time integrated over all runs so far, as seen by reactions as `time`.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn scheme(&self) -> RkScheme {
        self.scheme
    }

    pub fn compartments(&self) -> &[SimCompartment] {
        &self.compartments
    }

    pub fn compartment_ids(&self) -> Vec<&str> {
        self.compartments.iter().map(SimCompartment::compartment_id).collect()
    }

    pub fn species_ids(&self, compartment: usize) -> &[String] {
        self.compartments[compartment].species_ids()
    }

    /// Concentrations of a compartment, voxel-major with species varying fastest.
    ///
    /// # Panics
    /// If `compartment` is out of range.
    pub fn concentrations(&self, compartment: usize) -> &[f64] {
        self.compartments[compartment].concentrations()
    }

    pub fn set_concentrations(&mut self, compartment: usize, conc: &[f64]) -> Result<()> {
        self.compartments
            .get_mut(compartment)
            .ok_or_else(|| PixelSimError::Configuration(format!("no compartment {}", compartment)))?
            .set_concentrations(conc)
    }

    /// dc/dt of a compartment as of the last evaluation.
    pub fn dcdt(&self, compartment: usize) -> &[f64] {
        self.compartments[compartment].dcdt()
    }

    pub fn lower_order_concentration(&self, compartment: usize, species: usize, voxel: usize) -> f64 {
        self.compartments[compartment].lower_order_concentration(species, voxel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Compartment;
    use crate::model::{CompartmentDef, SpeciesDef};
    use crate::reactions::ReactionTerms;
    use pixelsim_common::{PixelIntegratorType, Volume, VoxelSize};

    fn single_voxel(c0: f64) -> Model {
        let geometry = Compartment::from_mask("c", Volume::new(1, 1, 1), VoxelSize::default(), &[true]).unwrap();
        Model::new(
            vec![CompartmentDef {
                geometry: Arc::new(geometry),
                species: vec![SpeciesDef::new("u", 0.0, c0)],
                reactions: ReactionTerms::None,
            }],
            vec![],
        )
    }

    fn options(integrator: PixelIntegratorType) -> PixelOptions {
        PixelOptions {
            integrator,
            ..PixelOptions::default()
        }
    }

    #[test]
    fn zero_time_is_a_no_op() {
        let mut sim = PixelSim::new(&single_voxel(3.0), &options(PixelIntegratorType::Rk323)).unwrap();
        assert_eq!(sim.run(0.0, -1.0).unwrap(), 0);
        assert_eq!(sim.concentrations(0), &[3.0]);
        assert_eq!(sim.error_message(), "");
    }

    #[test]
    fn stop_before_run_ends_after_first_step() {
        let mut sim = PixelSim::new(&single_voxel(1.0), &options(PixelIntegratorType::Rk212)).unwrap();
        sim.stop_handle().request_stop();
        let err = sim.run(1.0, -1.0).unwrap_err();
        assert_eq!(err, PixelSimError::Cancelled { steps: 1 });
        assert_eq!(sim.error_message(), "Simulation stopped early");
        // the flag was consumed, so the run can be resumed
        assert!(sim.run(1.0, -1.0).is_ok());
        assert_eq!(sim.error_message(), "");
    }

    #[test]
    fn time_accumulates_over_runs() {
        let mut sim = PixelSim::new(&single_voxel(1.0), &options(PixelIntegratorType::Rk435)).unwrap();
        sim.run(0.75, -1.0).unwrap();
        sim.run(0.5, -1.0).unwrap();
        assert!((sim.time() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn euler_without_diffusion_uses_max_timestep() {
        let opts = PixelOptions {
            max_timestep: 0.25,
            ..options(PixelIntegratorType::Rk101)
        };
        let mut sim = PixelSim::new(&single_voxel(1.0), &opts).unwrap();
        assert_eq!(sim.max_stable_timestep(), f64::MAX);
        assert_eq!(sim.run(1.0, -1.0).unwrap(), 4);
    }
}
