//! Read-only voxel geometry: compartments with their neighbour tables, and the
//! membranes (adjacent voxel pairs) between them.

use crate::error::{PixelSimError, Result};
use log::{debug, info};
use pixelsim_common::{Volume, Voxel, VoxelSize};

/// Axis along which flux crosses a membrane face.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FluxDirection {
    X,
    Y,
    Z,
}

impl FluxDirection {
    pub const ALL: [FluxDirection; 3] = [FluxDirection::X, FluxDirection::Y, FluxDirection::Z];

    /// Voxel edge length along this direction.
    pub fn length(self, voxel_size: &VoxelSize) -> f64 {
        match self {
            FluxDirection::X => voxel_size.width,
            FluxDirection::Y => voxel_size.height,
            FluxDirection::Z => voxel_size.depth,
        }
    }

    fn slot(self) -> usize {
        match self {
            FluxDirection::X => 0,
            FluxDirection::Y => 1,
            FluxDirection::Z => 2,
        }
    }
}

/// Neighbour slots in `Compartment::neighbours`.
const UP_X: usize = 0;
const DN_X: usize = 1;
const UP_Y: usize = 2;
const DN_Y: usize = 3;
const UP_Z: usize = 4;
const DN_Z: usize = 5;

/// An ordered set of voxels with nearest-neighbour lookup.
///
/// A voxel whose neighbour in some direction is outside the compartment uses its own
/// index as that neighbour, which gives zero-flux (Neumann) boundaries for diffusion.
#[derive(Debug, Clone)]
pub struct Compartment {
    id: String,
    volume: Volume,
    voxel_size: VoxelSize,
    voxels: Vec<Voxel>,
    /// Flat image index -> index in `voxels`.
    index_map: Vec<Option<usize>>,
    neighbours: Vec<[usize; 6]>,
}

impl Compartment {
    /// Builds a compartment from a mask over the image stack (x fastest, then y, then z).
    pub fn from_mask(id: &str, volume: Volume, voxel_size: VoxelSize, mask: &[bool]) -> Result<Self> {
        if mask.len() != volume.n_voxels() {
            return Err(PixelSimError::Configuration(format!(
                "mask for compartment '{}' has {} entries, image has {} voxels",
                id,
                mask.len(),
                volume.n_voxels()
            )));
        }
        let mut voxels = Vec::new();
        let mut index_map = vec![None; mask.len()];
        for z in 0..volume.depth {
            for y in 0..volume.height {
                for x in 0..volume.width {
                    if let Some(flat) = volume.index(x, y, z) {
                        if mask[flat] {
                            index_map[flat] = Some(voxels.len());
                            voxels.push(Voxel::new(x, y, z));
                        }
                    }
                }
            }
        }
        let mut compartment = Compartment {
            id: id.to_string(),
            volume,
            voxel_size,
            voxels,
            index_map,
            neighbours: Vec::new(),
        };
        compartment.neighbours = (0..compartment.voxels.len())
            .map(|i| {
                let v = compartment.voxels[i];
                let at = |dx: isize, dy: isize, dz: isize| {
                    compartment.offset_index(v, dx, dy, dz).unwrap_or(i)
                };
                [at(1, 0, 0), at(-1, 0, 0), at(0, 1, 0), at(0, -1, 0), at(0, 0, 1), at(0, 0, -1)]
            })
            .collect();
        info!("compartment '{}': {} voxels", compartment.id, compartment.voxels.len());
        Ok(compartment)
    }

    /// Index of the voxel at `v + (dx, dy, dz)` if it belongs to this compartment.
    fn offset_index(&self, v: Voxel, dx: isize, dy: isize, dz: isize) -> Option<usize> {
        let x = v.x.checked_add_signed(dx)?;
        let y = v.y.checked_add_signed(dy)?;
        let z = v.z.checked_add_signed(dz)?;
        self.index_of(Voxel::new(x, y, z))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn n_voxels(&self) -> usize {
        self.voxels.len()
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    pub fn voxel(&self, i: usize) -> Voxel {
        self.voxels[i]
    }

    pub fn volume(&self) -> Volume {
        self.volume
    }

    pub fn voxel_size(&self) -> VoxelSize {
        self.voxel_size
    }

    /// Physical `[x, y, z]` of voxel `i`. Image rows run top to bottom, so y is measured up
    /// from the bottom row.
    pub fn position(&self, i: usize) -> [f64; 3] {
        let v = self.voxels[i];
        let flipped_y = self.volume.height.saturating_sub(1 + v.y);
        [
            v.x as f64 * self.voxel_size.width,
            flipped_y as f64 * self.voxel_size.height,
            v.z as f64 * self.voxel_size.depth,
        ]
    }

    /// Index of `voxel` within this compartment, if it belongs to it.
    pub fn index_of(&self, voxel: Voxel) -> Option<usize> {
        let flat = self.volume.index(voxel.x, voxel.y, voxel.z)?;
        self.index_map[flat]
    }

    /// All six neighbours of voxel `i`: +x, -x, +y, -y, +z, -z.
    #[inline]
    pub fn neighbours(&self, i: usize) -> &[usize; 6] {
        &self.neighbours[i]
    }

    #[inline]
    pub fn up_x(&self, i: usize) -> usize {
        self.neighbours[i][UP_X]
    }

    #[inline]
    pub fn dn_x(&self, i: usize) -> usize {
        self.neighbours[i][DN_X]
    }

    #[inline]
    pub fn up_y(&self, i: usize) -> usize {
        self.neighbours[i][UP_Y]
    }

    #[inline]
    pub fn dn_y(&self, i: usize) -> usize {
        self.neighbours[i][DN_Y]
    }

    #[inline]
    pub fn up_z(&self, i: usize) -> usize {
        self.neighbours[i][UP_Z]
    }

    #[inline]
    pub fn dn_z(&self, i: usize) -> usize {
        self.neighbours[i][DN_Z]
    }
}

/// Pairs of face-adjacent voxels `(index in A, index in B)` straddling the boundary
/// between two compartments, grouped by flux direction.
#[derive(Debug, Clone)]
pub struct Membrane {
    id: String,
    compartment_a: String,
    compartment_b: String,
    index_pairs: [Vec<(usize, usize)>; 3],
}

impl Membrane {
    /// Finds every voxel of `a` that shares a face with a voxel of `b`.
    pub fn between(id: &str, a: &Compartment, b: &Compartment) -> Self {
        let mut index_pairs: [Vec<(usize, usize)>; 3] = Default::default();
        let offsets = [
            (FluxDirection::X, (1, 0, 0)),
            (FluxDirection::X, (-1, 0, 0)),
            (FluxDirection::Y, (0, 1, 0)),
            (FluxDirection::Y, (0, -1, 0)),
            (FluxDirection::Z, (0, 0, 1)),
            (FluxDirection::Z, (0, 0, -1)),
        ];
        for (ia, &va) in a.voxels().iter().enumerate() {
            for &(dir, (dx, dy, dz)) in &offsets {
                if let Some(ib) = b.offset_index(va, dx, dy, dz) {
                    index_pairs[dir.slot()].push((ia, ib));
                }
            }
        }
        Self::from_pairs(id, a.id(), b.id(), index_pairs)
    }

    /// A membrane with explicitly supplied index pairs per direction `[X, Y, Z]`.
    pub fn from_pairs(
        id: &str,
        compartment_a: &str,
        compartment_b: &str,
        index_pairs: [Vec<(usize, usize)>; 3],
    ) -> Self {
        let membrane = Membrane {
            id: id.to_string(),
            compartment_a: compartment_a.to_string(),
            compartment_b: compartment_b.to_string(),
            index_pairs,
        };
        info!(
            "membrane '{}' between '{}' and '{}': {} voxel pairs",
            membrane.id, membrane.compartment_a, membrane.compartment_b, membrane.n_pairs()
        );
        membrane
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn compartment_a_id(&self) -> &str {
        &self.compartment_a
    }

    pub fn compartment_b_id(&self) -> &str {
        &self.compartment_b
    }

    pub fn index_pairs(&self, direction: FluxDirection) -> &[(usize, usize)] {
        &self.index_pairs[direction.slot()]
    }

    pub fn n_pairs(&self) -> usize {
        self.index_pairs.iter().map(Vec::len).sum()
    }
}

/// Every compartment of a labelled image, plus a membrane for each pair of touching compartments.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub volume: Volume,
    pub voxel_size: VoxelSize,
    pub compartments: Vec<Compartment>,
    pub membranes: Vec<Membrane>,
}

impl Geometry {
    /// Builds compartments from image layers where each character labels a voxel.
    /// Characters with no compartment are outside the simulated domain.
    pub fn from_label_image(layers: &[Vec<String>], voxel_size: VoxelSize, labels: &[(String, char)]) -> Result<Self> {
        let height = layers.first().map_or(0, Vec::len);
        let width = layers
            .first()
            .and_then(|l| l.first())
            .map_or(0, |row| row.chars().count());
        let volume = Volume::new(width, height, layers.len());
        let mut label_image = Vec::with_capacity(volume.n_voxels());
        for layer in layers {
            for row in layer {
                if row.chars().count() != width {
                    return Err(PixelSimError::Configuration(format!("image row '{}' does not have width {}", row, width)));
                }
                label_image.extend(row.chars());
            }
        }
        if label_image.len() != volume.n_voxels() {
            return Err(PixelSimError::Configuration("image layers have inconsistent heights".to_string()));
        }
        let compartments = labels
            .iter()
            .map(|(id, label)| {
                let mask: Vec<bool> = label_image.iter().map(|c| c == label).collect();
                Compartment::from_mask(id, volume, voxel_size, &mask)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut membranes = Vec::new();
        for (i, a) in compartments.iter().enumerate() {
            for b in &compartments[i + 1..] {
                let membrane = Membrane::between(&format!("{}_{}", a.id(), b.id()), a, b);
                if membrane.n_pairs() > 0 {
                    membranes.push(membrane);
                } else {
                    debug!("compartments '{}' and '{}' do not touch", a.id(), b.id());
                }
            }
        }
        Ok(Geometry { volume, voxel_size, compartments, membranes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(r: &[&str]) -> Vec<Vec<String>> {
        vec![r.iter().map(|s| s.to_string()).collect()]
    }

    #[test]
    fn positions_measure_y_from_bottom_row() {
        let volume = Volume::new(2, 3, 1);
        let c = Compartment::from_mask("c", volume, VoxelSize::new(0.5, 2.0, 1.0), &[true; 6]).unwrap();
        // voxel 0 is the top-left pixel of the image
        assert_eq!(c.position(0), [0.0, 4.0, 0.0]);
        assert_eq!(c.position(5), [0.5, 0.0, 0.0]);
    }

    #[test]
    fn neighbours_use_self_at_boundary() {
        let volume = Volume::new(3, 3, 1);
        let c = Compartment::from_mask("c", volume, VoxelSize::default(), &[true; 9]).unwrap();
        assert_eq!(c.n_voxels(), 9);
        // centre voxel (1,1) has index 4
        assert_eq!(c.neighbours(4), &[5, 3, 7, 1, 4, 4]);
        // corner (0,0)
        assert_eq!(c.up_x(0), 1);
        assert_eq!(c.dn_x(0), 0);
        assert_eq!(c.up_y(0), 3);
        assert_eq!(c.dn_y(0), 0);
        assert_eq!(c.up_z(0), 0);
        assert_eq!(c.dn_z(0), 0);
    }

    #[test]
    fn neighbours_stay_inside_compartment() {
        let g = Geometry::from_label_image(
            &rows(&["AAB", "ABB"]),
            VoxelSize::default(),
            &[("a".to_string(), 'A'), ("b".to_string(), 'B')],
        )
        .unwrap();
        let a = &g.compartments[0];
        assert_eq!(a.voxels(), &[Voxel::new(0, 0, 0), Voxel::new(1, 0, 0), Voxel::new(0, 1, 0)]);
        // (1,0) has +x neighbour in B, so it is its own neighbour
        assert_eq!(a.up_x(1), 1);
        assert_eq!(a.dn_x(1), 0);
        assert_eq!(a.index_of(Voxel::new(2, 0, 0)), None);
    }

    #[test]
    fn membrane_pairs_by_direction() {
        let g = Geometry::from_label_image(
            &rows(&["AAB", "ABB", "..."]),
            VoxelSize::default(),
            &[("a".to_string(), 'A'), ("b".to_string(), 'B')],
        )
        .unwrap();
        assert_eq!(g.membranes.len(), 1);
        let m = &g.membranes[0];
        assert_eq!(m.id(), "a_b");
        assert_eq!(m.compartment_a_id(), "a");
        // A(1,0)->B(2,0) and A(0,1)->B(1,1) in x, A(1,0)->B(1,1) in y
        assert_eq!(m.index_pairs(FluxDirection::X), &[(1, 0), (2, 1)]);
        assert_eq!(m.index_pairs(FluxDirection::Y), &[(1, 1)]);
        assert!(m.index_pairs(FluxDirection::Z).is_empty());
        assert_eq!(m.n_pairs(), 3);
    }

    #[test]
    fn non_touching_compartments_have_no_membrane() {
        let g = Geometry::from_label_image(
            &rows(&["A.B"]),
            VoxelSize::default(),
            &[("a".to_string(), 'A'), ("b".to_string(), 'B')],
        )
        .unwrap();
        assert!(g.membranes.is_empty());
    }
}
