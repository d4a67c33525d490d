//! Reaction fluxes across the boundary between two compartments.

use crate::error::{PixelSimError, Result};
use crate::geometry::{FluxDirection, Membrane};
use crate::reactions::{Location, ReactionEvaluator, ReactionTerms};
use crate::sim_compartment::SimCompartment;
use log::debug;
use pixelsim_common::VoxelSize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Index of a [`SimCompartment`] within its simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompartmentId(pub usize);

/// Membrane reactions, evaluated on every voxel pair straddling the membrane.
///
/// Either side may be absent, for a membrane facing the outside of the simulated domain.
/// The reaction evaluator sees the species of A followed by the species of B and returns
/// an amount flux per unit area, which is divided by the voxel length along the flux
/// direction before being added to dc/dt on each side.
pub struct SimMembrane {
    membrane: Arc<Membrane>,
    compartment_a: Option<CompartmentId>,
    compartment_b: Option<CompartmentId>,
    n_species_a: usize,
    n_species_b: usize,
    voxel_size: VoxelSize,
    /// Position of each voxel pair per flux direction, taken from side A when present.
    positions: [Vec<[f64; 3]>; 3],
    reactions: Arc<dyn ReactionEvaluator>,
}

impl SimMembrane {
    /// `vol_over_l3` converts from the model's volume unit to its length unit cubed and
    /// scales every flux.
    pub fn new(
        membrane: Arc<Membrane>,
        compartment_a: Option<(CompartmentId, &SimCompartment)>,
        compartment_b: Option<(CompartmentId, &SimCompartment)>,
        reactions: &ReactionTerms,
        vol_over_l3: f64,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        let config_error = |msg: String| PixelSimError::Configuration(format!("membrane '{}': {}", membrane.id(), msg));
        if let (Some((a, _)), Some((b, _))) = (&compartment_a, &compartment_b) {
            if a == b {
                return Err(config_error("both sides are the same compartment".to_string()));
            }
        }
        let sides = [
            (compartment_a.map(|(_, c)| c), membrane.compartment_a_id(), 0),
            (compartment_b.map(|(_, c)| c), membrane.compartment_b_id(), 1),
        ];
        let mut voxel_size = None;
        let mut species_ids = Vec::new();
        for (comp, expected_id, side) in sides {
            let Some(comp) = comp else { continue };
            if comp.compartment_id() != expected_id {
                return Err(config_error(format!(
                    "expected compartment '{}', got '{}'",
                    expected_id,
                    comp.compartment_id()
                )));
            }
            let n_voxels = comp.n_voxels();
            for dir in FluxDirection::ALL {
                let pair = |p: &(usize, usize)| if side == 0 { p.0 } else { p.1 };
                if let Some(bad) = membrane.index_pairs(dir).iter().map(pair).find(|&i| i >= n_voxels) {
                    return Err(config_error(format!(
                        "voxel index {} out of range for compartment '{}'",
                        bad, expected_id
                    )));
                }
            }
            species_ids.extend_from_slice(comp.species_ids());
            voxel_size = Some(comp.geometry().voxel_size());
        }
        let Some(voxel_size) = voxel_size else {
            return Err(config_error("neither compartment is part of the simulation".to_string()));
        };
        let positions = FluxDirection::ALL.map(|dir| {
            membrane
                .index_pairs(dir)
                .iter()
                .map(|&(ia, ib)| match (compartment_a, compartment_b) {
                    (Some((_, a)), _) => a.geometry().position(ia),
                    (None, Some((_, b))) => b.geometry().position(ib),
                    (None, None) => [0.0; 3],
                })
                .collect()
        });
        let n_species_a = compartment_a.map_or(0, |(_, c)| c.n_species());
        let n_species_b = compartment_b.map_or(0, |(_, c)| c.n_species());
        let reactions = reactions.build(&species_ids, vol_over_l3, parameters)?;
        debug!(
            "membrane '{}': {} + {} species, {} voxel pairs",
            membrane.id(),
            n_species_a,
            n_species_b,
            membrane.n_pairs()
        );
        Ok(SimMembrane {
            compartment_a: compartment_a.map(|(id, _)| id),
            compartment_b: compartment_b.map(|(id, _)| id),
            n_species_a,
            n_species_b,
            voxel_size,
            positions,
            reactions,
            membrane,
        })
    }

    pub fn id(&self) -> &str {
        self.membrane.id()
    }

    pub fn compartment_a(&self) -> Option<CompartmentId> {
        self.compartment_a
    }

    pub fn compartment_b(&self) -> Option<CompartmentId> {
        self.compartment_b
    }

    /// Adds the membrane fluxes at simulation time `time` to dc/dt of both compartments.
    pub fn evaluate_reactions(&self, compartments: &mut [SimCompartment], time: f64) {
        let (na, nb) = (self.n_species_a, self.n_species_b);
        let (comp_a, comp_b) = pair_mut(compartments, self.compartment_a, self.compartment_b);
        let mut side_a = comp_a.map(SimCompartment::conc_and_dcdt_mut);
        let mut side_b = comp_b.map(SimCompartment::conc_and_dcdt_mut);
        let mut input = vec![0.0; na + nb];
        let mut output = vec![0.0; na + nb];
        for (dir, positions) in FluxDirection::ALL.into_iter().zip(&self.positions) {
            let inv_length = 1.0 / dir.length(&self.voxel_size);
            for (&(ia, ib), &position) in self.membrane.index_pairs(dir).iter().zip(positions) {
                if let Some((conc, _)) = &side_a {
                    input[..na].copy_from_slice(&conc[ia * na..(ia + 1) * na]);
                }
                if let Some((conc, _)) = &side_b {
                    input[na..].copy_from_slice(&conc[ib * nb..(ib + 1) * nb]);
                }
                self.reactions.evaluate_at(&mut output, &input, &Location { time, position });
                if let Some((_, dcdt)) = &mut side_a {
                    for (d, flux) in dcdt[ia * na..(ia + 1) * na].iter_mut().zip(&output[..na]) {
                        *d += flux * inv_length;
                    }
                }
                if let Some((_, dcdt)) = &mut side_b {
                    for (d, flux) in dcdt[ib * nb..(ib + 1) * nb].iter_mut().zip(&output[na..]) {
                        *d += flux * inv_length;
                    }
                }
            }
        }
    }
}

/// Two distinct elements of a slice, either of which may be absent.
fn pair_mut<T>(items: &mut [T], a: Option<CompartmentId>, b: Option<CompartmentId>) -> (Option<&mut T>, Option<&mut T>) {
    match (a, b) {
        (Some(CompartmentId(a)), Some(CompartmentId(b))) if a < b => {
            let (lo, hi) = items.split_at_mut(b);
            (lo.get_mut(a), hi.first_mut())
        }
        (Some(CompartmentId(a)), Some(CompartmentId(b))) => {
            let (lo, hi) = items.split_at_mut(a);
            (hi.first_mut(), lo.get_mut(b))
        }
        (Some(CompartmentId(a)), None) => (items.get_mut(a), None),
        (None, Some(CompartmentId(b))) => (None, items.get_mut(b)),
        (None, None) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Compartment;
    use crate::model::SpeciesDef;
    use crate::parallel::Sequential;
    use crate::reactions::{FnEvaluator, NoReactions, ReactionDef};
    use pixelsim_common::Volume;

    fn compartment(id: &str, mask: &[bool], species: &str, c0: f64) -> SimCompartment {
        let geometry = Compartment::from_mask(id, Volume::new(mask.len(), 1, 1), VoxelSize::new(0.5, 1.0, 1.0), mask)
            .unwrap();
        SimCompartment::new(Arc::new(geometry), &[SpeciesDef::new(species, 0.0, c0)], Arc::new(NoReactions)).unwrap()
    }

    fn two_sides() -> (Vec<SimCompartment>, Arc<Membrane>) {
        let a = compartment("a", &[true, true, false, false], "u", 2.0);
        let b = compartment("b", &[false, false, true, true], "v", 0.0);
        let membrane = Arc::new(Membrane::between("a_b", a.geometry(), b.geometry()));
        (vec![a, b], membrane)
    }

    #[test]
    fn flux_moves_amount_between_sides() {
        let (mut comps, membrane) = two_sides();
        let terms = ReactionTerms::Expressions(vec![ReactionDef::new("t", "3 * u", &[("u", -1.0), ("v", 1.0)])]);
        let m = SimMembrane::new(
            membrane,
            Some((CompartmentId(0), &comps[0])),
            Some((CompartmentId(1), &comps[1])),
            &terms,
            1.0,
            &BTreeMap::new(),
        )
        .unwrap();
        for c in comps.iter_mut() {
            c.evaluate_reactions_and_diffusion(&Sequential, 0.0);
        }
        m.evaluate_reactions(&mut comps, 0.0);
        // flux 6 divided by the x voxel length 0.5
        assert_eq!(comps[0].dcdt(), &[0.0, -12.0]);
        assert_eq!(comps[1].dcdt(), &[12.0, 0.0]);
    }

    #[test]
    fn side_order_does_not_matter_for_storage() {
        let (mut comps, _) = two_sides();
        comps.swap(0, 1);
        let membrane = Arc::new(Membrane::between("a_b", comps[1].geometry(), comps[0].geometry()));
        let terms = ReactionTerms::Custom(Arc::new(FnEvaluator(|out: &mut [f64], c: &[f64]| {
            out[0] = -c[0];
            out[1] = c[0];
        })));
        let m = SimMembrane::new(
            membrane,
            Some((CompartmentId(1), &comps[1])),
            Some((CompartmentId(0), &comps[0])),
            &terms,
            1.0,
            &BTreeMap::new(),
        )
        .unwrap();
        m.evaluate_reactions(&mut comps, 0.0);
        assert_eq!(comps[1].dcdt(), &[0.0, -4.0]);
        assert_eq!(comps[0].dcdt(), &[4.0, 0.0]);
    }

    #[test]
    fn absent_side_is_skipped() {
        let (mut comps, membrane) = two_sides();
        let terms = ReactionTerms::Custom(Arc::new(FnEvaluator(|out: &mut [f64], c: &[f64]| out[0] = -c[0])));
        let m = SimMembrane::new(membrane, Some((CompartmentId(0), &comps[0])), None, &terms, 2.0, &BTreeMap::new())
            .unwrap();
        m.evaluate_reactions(&mut comps, 0.0);
        assert_eq!(comps[0].dcdt(), &[0.0, -8.0]);
        assert_eq!(comps[1].dcdt(), &[0.0, 0.0]);
    }

    #[test]
    fn flux_sees_time_and_side_a_position() {
        let (mut comps, membrane) = two_sides();
        let terms = ReactionTerms::Expressions(vec![ReactionDef::new("t", "time * x", &[("v", 1.0)])]);
        let m = SimMembrane::new(
            membrane,
            Some((CompartmentId(0), &comps[0])),
            Some((CompartmentId(1), &comps[1])),
            &terms,
            1.0,
            &BTreeMap::new(),
        )
        .unwrap();
        m.evaluate_reactions(&mut comps, 4.0);
        // the pair's A voxel is at x = 0.5, so the flux is 2, over a length of 0.5
        assert_eq!(comps[1].dcdt(), &[4.0, 0.0]);
    }

    #[test]
    fn rejects_inconsistent_references() {
        let (comps, membrane) = two_sides();
        let terms = ReactionTerms::None;
        let params = BTreeMap::new();
        let same = SimMembrane::new(
            Arc::clone(&membrane),
            Some((CompartmentId(0), &comps[0])),
            Some((CompartmentId(0), &comps[0])),
            &terms,
            1.0,
            &params,
        );
        assert!(matches!(same, Err(PixelSimError::Configuration(_))));
        let swapped = SimMembrane::new(
            Arc::clone(&membrane),
            Some((CompartmentId(1), &comps[1])),
            None,
            &terms,
            1.0,
            &params,
        );
        assert!(matches!(swapped, Err(PixelSimError::Configuration(_))));
        let neither = SimMembrane::new(membrane, None, None, &terms, 1.0, &params);
        assert!(matches!(neither, Err(PixelSimError::Configuration(_))));
    }
}
