//! Model snapshot consumed by the integrator: geometry, species and reaction terms for
//! every compartment and membrane.

use crate::error::{PixelSimError, Result};
use crate::geometry::{Compartment, Geometry, Membrane};
use crate::reactions::{ReactionDef, ReactionTerms};
use crate::units::{vol_over_l3, LengthUnit, VolumeUnit};
use log::{debug, info};
use pixelsim_common::SimulationConfig;
use rand::prelude::*;
use rand_distr::Normal;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A per-voxel species property: initial concentration or diffusion constant.
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelValues {
    Uniform(f64),
    /// One value per voxel of the compartment.
    PerVoxel(Vec<f64>),
}

impl VoxelValues {
    /// Expands to one value per voxel, failing if a per-voxel list has the wrong length.
    pub fn to_vec(&self, n_voxels: usize) -> Option<Vec<f64>> {
        match self {
            VoxelValues::Uniform(c) => Some(vec![*c; n_voxels]),
            VoxelValues::PerVoxel(v) if v.len() == n_voxels => Some(v.clone()),
            VoxelValues::PerVoxel(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeciesDef {
    pub id: String,
    pub name: String,
    /// Physical diffusion constant, in [length]^2 / [time].
    pub diffusion_constant: VoxelValues,
    /// Non-spatial species are kept uniform by averaging their dc/dt over the compartment.
    pub is_spatial: bool,
    pub initial: VoxelValues,
}

impl SpeciesDef {
    pub fn new(id: &str, diffusion_constant: f64, initial: f64) -> Self {
        SpeciesDef {
            id: id.to_string(),
            name: id.to_string(),
            diffusion_constant: VoxelValues::Uniform(diffusion_constant),
            is_spatial: true,
            initial: VoxelValues::Uniform(initial),
        }
    }

    pub fn non_spatial(mut self) -> Self {
        self.is_spatial = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompartmentDef {
    pub geometry: Arc<Compartment>,
    pub species: Vec<SpeciesDef>,
    pub reactions: ReactionTerms,
}

/// Reactions on a membrane see the species of compartment A followed by those of B.
#[derive(Debug, Clone)]
pub struct MembraneDef {
    pub geometry: Arc<Membrane>,
    pub reactions: ReactionTerms,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub compartments: Vec<CompartmentDef>,
    pub membranes: Vec<MembraneDef>,
    pub length_unit: LengthUnit,
    pub volume_unit: VolumeUnit,
    /// Named constants available to reaction expressions.
    pub parameters: BTreeMap<String, f64>,
}

impl Model {
    /// A model in micrometres with concentrations per cubic micrometre, so membrane
    /// fluxes need no unit conversion.
    pub fn new(compartments: Vec<CompartmentDef>, membranes: Vec<MembraneDef>) -> Self {
        Model {
            compartments,
            membranes,
            length_unit: LengthUnit::Micrometre,
            volume_unit: VolumeUnit::Cubic(LengthUnit::Micrometre),
            parameters: BTreeMap::new(),
        }
    }

    /// `[volume] / [length]^3` for this model's units.
    pub fn vol_over_l3(&self) -> f64 {
        vol_over_l3(self.length_unit, self.volume_unit)
    }

    pub fn compartment_index(&self, id: &str) -> Option<usize> {
        self.compartments.iter().position(|c| c.geometry.id() == id)
    }

    /// Builds the model described by a run configuration.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let labels: Vec<(String, char)> = config
            .geometry
            .compartments
            .iter()
            .map(|c| (c.id.clone(), c.label))
            .collect();
        let geometry = Geometry::from_label_image(&config.geometry.image_layers(), config.geometry.voxel_size, &labels)?;
        let reactions_at = |location: &str| -> ReactionTerms {
            let defs: Vec<ReactionDef> = config
                .reactions
                .iter()
                .filter(|r| r.location == location)
                .map(|r| ReactionDef {
                    id: r.id.clone(),
                    expression: r.expression.clone(),
                    stoichiometry: r.stoichiometry.iter().map(|(s, c)| (s.clone(), *c)).collect(),
                })
                .collect();
            if defs.is_empty() {
                ReactionTerms::None
            } else {
                ReactionTerms::Expressions(defs)
            }
        };

        let mut rng = StdRng::seed_from_u64(config.initial_conditions.seed);
        let mut compartments = Vec::with_capacity(geometry.compartments.len());
        for compartment in geometry.compartments {
            let mut species = Vec::new();
            for s in config.species.iter().filter(|s| s.compartment == compartment.id()) {
                let initial = if s.noise > 0.0 {
                    let dist = Normal::new(s.initial_concentration, s.noise)
                        .map_err(|e| PixelSimError::Configuration(format!("species '{}': {}", s.id, e)))?;
                    VoxelValues::PerVoxel(
                        (0..compartment.n_voxels()).map(|_| rng.sample(dist).max(0.0)).collect(),
                    )
                } else {
                    VoxelValues::Uniform(s.initial_concentration)
                };
                species.push(SpeciesDef {
                    id: s.id.clone(),
                    name: s.name.clone().unwrap_or_else(|| s.id.clone()),
                    diffusion_constant: VoxelValues::Uniform(s.diffusion_constant),
                    is_spatial: s.is_spatial,
                    initial,
                });
            }
            debug!("compartment '{}': {} species", compartment.id(), species.len());
            compartments.push(CompartmentDef {
                reactions: reactions_at(compartment.id()),
                geometry: Arc::new(compartment),
                species,
            });
        }
        let membranes = geometry
            .membranes
            .into_iter()
            .map(|m| MembraneDef {
                reactions: reactions_at(m.id()),
                geometry: Arc::new(m),
            })
            .collect();
        let model = Model {
            compartments,
            membranes,
            length_unit: config.geometry.length_unit.parse()?,
            volume_unit: config.geometry.volume_unit.parse()?,
            parameters: config.parameters.clone(),
        };
        info!(
            "Model: {} compartments, {} membranes, [vol]/[length]^3 = {}",
            model.compartments.len(),
            model.membranes.len(),
            model.vol_over_l3()
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [geometry]
        image = ["AAB", "AAB"]
        compartments = [ { id = "cell", label = "A" }, { id = "nucleus", label = "B" } ]
        length_unit = "um"
        volume_unit = "fL"

        [[species]]
        id = "u"
        compartment = "cell"
        diffusion_constant = 1.0
        initial_concentration = 2.0
        noise = 0.1

        [[species]]
        id = "v"
        compartment = "nucleus"

        [[reactions]]
        id = "transport"
        location = "cell_nucleus"
        expression = "k * u"
        stoichiometry = { u = -1.0, v = 1.0 }

        [parameters]
        k = 0.1

        [timing]
        simulation_time = 1.0
        record_interval = 0.5
    "#;

    #[test]
    fn builds_model_from_config() {
        let config = SimulationConfig::from_toml_str(CONFIG).unwrap();
        let model = Model::from_config(&config).unwrap();
        assert_eq!(model.compartments.len(), 2);
        assert_eq!(model.membranes.len(), 1);
        assert_eq!(model.compartment_index("nucleus"), Some(1));
        assert!(model.compartments[0].reactions.is_empty());
        assert!(!model.membranes[0].reactions.is_empty());
        assert!((model.vol_over_l3() - 1.0).abs() < 1e-9);
        match &model.compartments[0].species[0].initial {
            VoxelValues::PerVoxel(v) => {
                assert_eq!(v.len(), 4);
                assert!(v.iter().all(|c| *c >= 0.0));
            }
            other => panic!("expected noisy initial concentration, got {:?}", other),
        }
    }

    #[test]
    fn noise_is_reproducible() {
        let config = SimulationConfig::from_toml_str(CONFIG).unwrap();
        let a = Model::from_config(&config).unwrap();
        let b = Model::from_config(&config).unwrap();
        assert_eq!(a.compartments[0].species[0].initial, b.compartments[0].species[0].initial);
    }
}
