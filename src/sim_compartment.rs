//! Concentration state and the per-compartment kernels of the integrator.
//!
//! All buffers are flat `Vec<f64>` in voxel-major order with species varying fastest:
//! element `i * n_species + s` is species `s` in voxel `i`. `dcdt`, `s2` and `s3` have the
//! same layout and length as the concentrations.

use crate::error::{PixelSimError, Result};
use crate::geometry::Compartment;
use crate::model::{SpeciesDef, VoxelValues};
use crate::parallel::{ParallelFor, BLOCK_VOXELS};
use crate::reactions::{Location, ReactionEvaluator};
use crate::rk::{RkError, RkFinalise, RkStage};
use log::{debug, trace};
use rayon::prelude::*;
use std::sync::Arc;

/// Integrator state for the species of one compartment.
pub struct SimCompartment {
    geometry: Arc<Compartment>,
    reactions: Arc<dyn ReactionEvaluator>,
    species_ids: Vec<String>,
    species_names: Vec<String>,
    n_species: usize,
    n_voxels: usize,

    // --- State buffers ---
    conc: Vec<f64>,
    dcdt: Vec<f64>,
    // s2 accumulates the low-storage register, then holds the embedded solution
    s2: Vec<f64>,
    // concentrations at the start of the current step
    s3: Vec<f64>,

    /// Diffusion constant of each species in each voxel, indexed `[species][voxel]`.
    diffusion: Vec<Vec<f64>>,
    /// `[1/dx^2, 1/dy^2, 1/dz^2]`, zero along axes the geometry doesn't extend in.
    inv_spacing2: [f64; 3],
    /// Physical position of each voxel.
    positions: Vec<[f64; 3]>,
    non_spatial: Vec<usize>,
    max_stable_timestep: f64,
}

impl SimCompartment {
    /// Allocates the buffers for `species` on `geometry` and sets the initial concentrations.
    pub fn new(
        geometry: Arc<Compartment>,
        species: &[SpeciesDef],
        reactions: Arc<dyn ReactionEvaluator>,
    ) -> Result<Self> {
        let n_species = species.len();
        let n_voxels = geometry.n_voxels();
        let squared = geometry.voxel_size().squared();
        let active = geometry.volume().active_axes();

        let mut inv_spacing2 = [0.0; 3];
        for axis in 0..3 {
            if active[axis] {
                inv_spacing2[axis] = 1.0 / squared[axis];
            }
        }

        let mut conc = vec![0.0; n_species * n_voxels];
        let mut diffusion = Vec::with_capacity(n_species);
        let mut non_spatial = Vec::new();
        for (s, def) in species.iter().enumerate() {
            let d = per_voxel(&def.diffusion_constant, n_voxels, &def.id, "diffusion constants")?;
            if let Some(bad) = d.iter().find(|d| **d < 0.0 || !d.is_finite()) {
                return Err(PixelSimError::Configuration(format!(
                    "species '{}' has invalid diffusion constant {}",
                    def.id, bad
                )));
            }
            diffusion.push(d);
            let initial = per_voxel(&def.initial, n_voxels, &def.id, "initial values")?;
            for (i, c) in initial.into_iter().enumerate() {
                conc[i * n_species + s] = c;
            }
            if !def.is_spatial {
                non_spatial.push(s);
            }
        }

        let max_stable_timestep = max_stable_timestep(&diffusion, inv_spacing2);
        debug!(
            "compartment '{}': {} species, {} voxels, max stable timestep {:e}",
            geometry.id(),
            n_species,
            n_voxels,
            max_stable_timestep
        );

        Ok(SimCompartment {
            species_ids: species.iter().map(|s| s.id.clone()).collect(),
            species_names: species.iter().map(|s| s.name.clone()).collect(),
            n_species,
            n_voxels,
            dcdt: vec![0.0; conc.len()],
            s2: Vec::new(),
            s3: Vec::new(),
            conc,
            diffusion,
            inv_spacing2,
            positions: (0..n_voxels).map(|i| geometry.position(i)).collect(),
            non_spatial,
            max_stable_timestep,
            geometry,
            reactions,
        })
    }

    /// Elements per parallel block of a flat buffer.
    fn block_len(&self) -> usize {
        BLOCK_VOXELS * self.n_species.max(1)
    }

    fn is_empty(&self) -> bool {
        self.n_species == 0 || self.n_voxels == 0
    }

    /// Overwrites dc/dt with the reactions at simulation time `time` plus diffusion, one
    /// pass over the voxels.
    pub fn evaluate_reactions_and_diffusion<E: ParallelFor>(&mut self, exec: &E, time: f64) {
        if self.is_empty() {
            return;
        }
        let n_species = self.n_species;
        let reactions = ReactionKernel {
            evaluator: &*self.reactions,
            positions: &self.positions,
            time,
        };
        let diffusion = DiffusionKernel {
            geometry: &self.geometry,
            diffusion: &self.diffusion,
            inv_spacing2: self.inv_spacing2,
        };
        let conc = &self.conc;
        exec.for_each(
            self.dcdt.par_chunks_mut(BLOCK_VOXELS * n_species).enumerate(),
            |(block, dcdt)| {
                let first = block * BLOCK_VOXELS;
                reactions.apply(conc, n_species, first, dcdt);
                diffusion.add(conc, n_species, first, dcdt);
            },
        );
    }

    /// Overwrites dc/dt with the reaction terms alone.
    pub fn evaluate_reactions<E: ParallelFor>(&mut self, exec: &E, time: f64) {
        if self.is_empty() {
            return;
        }
        let n_species = self.n_species;
        let reactions = ReactionKernel {
            evaluator: &*self.reactions,
            positions: &self.positions,
            time,
        };
        let conc = &self.conc;
        exec.for_each(
            self.dcdt.par_chunks_mut(BLOCK_VOXELS * n_species).enumerate(),
            |(block, dcdt)| reactions.apply(conc, n_species, block * BLOCK_VOXELS, dcdt),
        );
    }

    /// Adds the discrete diffusion term to dc/dt. The flux through each face uses the mean
    /// of the diffusion constants either side of it. Boundary voxels use themselves as the
    /// missing neighbour (zero flux).
    pub fn evaluate_diffusion_operator<E: ParallelFor>(&mut self, exec: &E) {
        if self.is_empty() {
            return;
        }
        let n_species = self.n_species;
        let diffusion = DiffusionKernel {
            geometry: &self.geometry,
            diffusion: &self.diffusion,
            inv_spacing2: self.inv_spacing2,
        };
        let conc = &self.conc;
        exec.for_each(
            self.dcdt.par_chunks_mut(BLOCK_VOXELS * n_species).enumerate(),
            |(block, dcdt)| diffusion.add(conc, n_species, block * BLOCK_VOXELS, dcdt),
        );
    }

    /// Replaces dc/dt of each non-spatial species by its mean over the compartment.
    pub fn spatially_average_dcdt(&mut self) {
        if self.n_voxels == 0 {
            return;
        }
        let n_species = self.n_species;
        for &s in &self.non_spatial {
            let sum: f64 = self.dcdt.iter().skip(s).step_by(n_species).sum();
            let avg = sum / self.n_voxels as f64;
            self.dcdt.iter_mut().skip(s).step_by(n_species).for_each(|d| *d = avg);
        }
    }

    /// `c += dt * dc/dt`
    pub fn do_forwards_euler_timestep<E: ParallelFor>(&mut self, exec: &E, dt: f64) {
        let block = self.block_len();
        exec.for_each(
            self.conc.par_chunks_mut(block).zip(self.dcdt.par_chunks(block)),
            |(c, dcdt)| {
                c.iter_mut().zip(dcdt).for_each(|(c, d)| *c += dt * d);
            },
        );
    }

    /// Starts a Runge-Kutta step: `s2 = 0`, `s3 = c`.
    pub fn do_rk_init(&mut self) {
        self.s2.clear();
        self.s2.resize(self.conc.len(), 0.0);
        self.s3.clone_from(&self.conc);
    }

    /// One low-storage stage, using the dc/dt of the current concentrations.
    pub fn do_rk_substep<E: ParallelFor>(&mut self, exec: &E, dt: f64, stage: &RkStage) {
        let block = self.block_len();
        let RkStage { g1, g2, g3, beta, delta } = *stage;
        let beta_dt = beta * dt;
        exec.for_each(
            self.conc
                .par_chunks_mut(block)
                .zip(self.s2.par_chunks_mut(block))
                .zip(self.s3.par_chunks(block))
                .zip(self.dcdt.par_chunks(block)),
            |(((c, s2), s3), dcdt)| {
                for i in 0..c.len() {
                    s2[i] += delta * c[i];
                    c[i] = g1 * c[i] + g2 * s2[i] + g3 * s3[i] + beta_dt * dcdt[i];
                }
            },
        );
    }

    /// Writes the embedded lower order solution into `s2`.
    pub fn do_rk_finalise<E: ParallelFor>(&mut self, exec: &E, finalise: &RkFinalise) {
        let block = self.block_len();
        let RkFinalise { c_factor, s2_factor, s3_factor } = *finalise;
        exec.for_each(
            self.s2
                .par_chunks_mut(block)
                .zip(self.conc.par_chunks(block))
                .zip(self.s3.par_chunks(block)),
            |((s2, c), s3)| {
                for i in 0..s2.len() {
                    s2[i] = c_factor * c[i] + s2_factor * s2[i] + s3_factor * s3[i];
                }
            },
        );
    }

    /// Restores the concentrations saved by [`do_rk_init`](Self::do_rk_init).
    pub fn undo_rk_step<E: ParallelFor>(&mut self, exec: &E) {
        if self.s3.len() != self.conc.len() {
            return;
        }
        let block = self.block_len();
        exec.for_each(
            self.conc.par_chunks_mut(block).zip(self.s3.par_chunks(block)),
            |(c, s3)| c.copy_from_slice(s3),
        );
    }

    /// Max absolute and relative difference between the solution and the embedded one.
    ///
    /// The relative error is normalised by the mean of the new and old concentration, with
    /// `epsilon` guarding against division by zero. Any non-finite term makes the result
    /// non-finite.
    pub fn calculate_rk_error(&self, epsilon: f64) -> RkError {
        let mut err = RkError::default();
        for ((c, s2), s3) in self.conc.iter().zip(&self.s2).zip(&self.s3) {
            let abs = (c - s2).abs();
            let rel = abs / (0.5 * (c + s3 + epsilon));
            if !abs.is_finite() || !rel.is_finite() {
                return RkError { abs: f64::NAN, rel: f64::NAN };
            }
            err.abs = err.abs.max(abs);
            err.rel = err.rel.max(rel);
        }
        trace!("compartment '{}': rk error {:?}", self.geometry.id(), err);
        err
    }

    /// The species with the largest relative error of the last step, and the voxels where
    /// its relative error reaches `threshold`.
    pub fn largest_relative_error(&self, epsilon: f64, threshold: f64) -> Option<(usize, Vec<usize>)> {
        if self.is_empty() || self.s2.len() != self.conc.len() {
            return None;
        }
        let rel_at = |k: usize| {
            (self.conc[k] - self.s2[k]).abs() / (0.5 * (self.conc[k] + self.s3[k] + epsilon))
        };
        let (worst, _) = (0..self.conc.len())
            .map(|k| (k, rel_at(k)))
            .fold((0, f64::MIN), |acc, x| if x.1 > acc.1 { x } else { acc });
        let species = worst % self.n_species;
        let voxels = (0..self.n_voxels)
            .filter(|i| rel_at(i * self.n_species + species) >= threshold)
            .collect();
        Some((species, voxels))
    }

    pub fn compartment_id(&self) -> &str {
        self.geometry.id()
    }

    pub fn geometry(&self) -> &Compartment {
        &self.geometry
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn species_names(&self) -> &[String] {
        &self.species_names
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn concentrations(&self) -> &[f64] {
        &self.conc
    }

    /// Replaces the concentrations, e.g. to restart from a saved state.
    pub fn set_concentrations(&mut self, conc: &[f64]) -> Result<()> {
        if conc.len() != self.conc.len() {
            return Err(PixelSimError::Configuration(format!(
                "compartment '{}' expects {} concentrations, got {}",
                self.compartment_id(),
                self.conc.len(),
                conc.len()
            )));
        }
        self.conc.copy_from_slice(conc);
        Ok(())
    }

    pub fn dcdt(&self) -> &[f64] {
        &self.dcdt
    }

    /// Concentrations to read and dc/dt to add to, for membrane fluxes.
    pub(crate) fn conc_and_dcdt_mut(&mut self) -> (&[f64], &mut [f64]) {
        (&self.conc, &mut self.dcdt)
    }

    /// Embedded solution of the last adaptive step, 0 before any such step.
    pub fn lower_order_concentration(&self, species: usize, voxel: usize) -> f64 {
        self.s2.get(voxel * self.n_species + species).copied().unwrap_or(0.0)
    }

    /// Largest forwards Euler step for which explicit diffusion is stable.
    pub fn max_stable_timestep(&self) -> f64 {
        self.max_stable_timestep
    }
}

fn per_voxel(values: &VoxelValues, n_voxels: usize, species: &str, what: &str) -> Result<Vec<f64>> {
    values.to_vec(n_voxels).ok_or_else(|| {
        PixelSimError::Configuration(format!("species '{}' needs {} {}", species, n_voxels, what))
    })
}

/// `1 / (2 * max(D) * sum_k 1/dk^2)` over the worst species, `f64::MAX` if nothing diffuses.
fn max_stable_timestep(diffusion: &[Vec<f64>], inv_spacing2: [f64; 3]) -> f64 {
    let sum: f64 = inv_spacing2.iter().sum();
    diffusion
        .iter()
        .map(|d| d.iter().copied().fold(0.0, f64::max) * sum)
        .filter(|rate| *rate > 0.0)
        .map(|rate| 1.0 / (2.0 * rate))
        .fold(f64::MAX, f64::min)
}

struct ReactionKernel<'a> {
    evaluator: &'a dyn ReactionEvaluator,
    positions: &'a [[f64; 3]],
    time: f64,
}

impl ReactionKernel<'_> {
    fn apply(&self, conc: &[f64], n_species: usize, first_voxel: usize, dcdt: &mut [f64]) {
        for (k, out) in dcdt.chunks_exact_mut(n_species).enumerate() {
            let i = first_voxel + k;
            let start = i * n_species;
            let location = Location {
                time: self.time,
                position: self.positions[i],
            };
            self.evaluator.evaluate_at(out, &conc[start..start + n_species], &location);
        }
    }
}

struct DiffusionKernel<'a> {
    geometry: &'a Compartment,
    diffusion: &'a [Vec<f64>],
    inv_spacing2: [f64; 3],
}

impl DiffusionKernel<'_> {
    fn add(&self, conc: &[f64], n_species: usize, first_voxel: usize, dcdt: &mut [f64]) {
        for (k, out) in dcdt.chunks_exact_mut(n_species).enumerate() {
            let i = first_voxel + k;
            let nn = self.geometry.neighbours(i);
            for (s, out) in out.iter_mut().enumerate() {
                let d = &self.diffusion[s];
                let c = conc[i * n_species + s];
                // neighbours come in (+k, -k) pairs per axis
                let mut sum = 0.0;
                for (j, &nb) in nn.iter().enumerate() {
                    sum += 0.5 * (d[i] + d[nb]) * self.inv_spacing2[j / 2] * (conc[nb * n_species + s] - c);
                }
                *out += sum;
            }
        }
    }
}
