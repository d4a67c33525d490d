use serde::{Deserialize, Serialize};

/// Integer location of a voxel in the geometry image stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Voxel {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Voxel {
    /// Creates a new Voxel.
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Voxel { x, y, z }
    }
}

/// Dimensions of the image stack, in voxels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Volume {
    /// Creates a new Volume.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Volume { width, height, depth }
    }

    /// Total number of voxels in the image stack.
    pub fn n_voxels(&self) -> usize {
        self.width * self.height * self.depth
    }

    /// Flat index of a voxel, x fastest, then y, then z.
    /// Returns `None` if the voxel lies outside the volume.
    pub fn index(&self, x: usize, y: usize, z: usize) -> Option<usize> {
        if x < self.width && y < self.height && z < self.depth {
            Some(x + self.width * (y + self.height * z))
        } else {
            None
        }
    }

    /// Whether the stack extends along each axis (extent > 1).
    pub fn active_axes(&self) -> [bool; 3] {
        [self.width > 1, self.height > 1, self.depth > 1]
    }
}

/// Physical size of a single voxel, in model length units.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelSize {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

impl VoxelSize {
    /// Creates a new VoxelSize.
    pub fn new(width: f64, height: f64, depth: f64) -> Self {
        VoxelSize { width, height, depth }
    }

    /// A cube with the given edge length.
    pub fn uniform(length: f64) -> Self {
        VoxelSize { width: length, height: length, depth: length }
    }

    /// Squared edge lengths `[dx², dy², dz²]`.
    pub fn squared(&self) -> [f64; 3] {
        [
            self.width * self.width,
            self.height * self.height,
            self.depth * self.depth,
        ]
    }
}

impl Default for VoxelSize {
    fn default() -> Self {
        VoxelSize::uniform(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_index_is_x_fastest() {
        let v = Volume::new(3, 2, 2);
        assert_eq!(v.n_voxels(), 12);
        assert_eq!(v.index(0, 0, 0), Some(0));
        assert_eq!(v.index(2, 0, 0), Some(2));
        assert_eq!(v.index(0, 1, 0), Some(3));
        assert_eq!(v.index(1, 1, 1), Some(10));
        assert_eq!(v.index(3, 0, 0), None);
        assert_eq!(v.active_axes(), [true, true, true]);
        assert_eq!(Volume::new(4, 4, 1).active_axes(), [true, true, false]);
    }
}
