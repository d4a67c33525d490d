//! Length and volume units, and the flux conversion factor derived from them.

use crate::error::{PixelSimError, Result};
use std::str::FromStr;

/// Unit of length used for voxel sizes and diffusion constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Metre,
    Decimetre,
    Centimetre,
    Millimetre,
    Micrometre,
    Nanometre,
}

impl LengthUnit {
    /// Size of the unit in metres.
    pub fn in_metres(self) -> f64 {
        match self {
            LengthUnit::Metre => 1.0,
            LengthUnit::Decimetre => 1e-1,
            LengthUnit::Centimetre => 1e-2,
            LengthUnit::Millimetre => 1e-3,
            LengthUnit::Micrometre => 1e-6,
            LengthUnit::Nanometre => 1e-9,
        }
    }
}

impl FromStr for LengthUnit {
    type Err = PixelSimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "m" => Ok(LengthUnit::Metre),
            "dm" => Ok(LengthUnit::Decimetre),
            "cm" => Ok(LengthUnit::Centimetre),
            "mm" => Ok(LengthUnit::Millimetre),
            "um" => Ok(LengthUnit::Micrometre),
            "nm" => Ok(LengthUnit::Nanometre),
            other => Err(PixelSimError::Configuration(format!("unsupported length unit '{}'", other))),
        }
    }
}

/// Unit of volume that concentrations are expressed per.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeUnit {
    /// A multiple of one litre.
    Litre(f64),
    /// The cube of a length unit.
    Cubic(LengthUnit),
}

impl VolumeUnit {
    /// Size of the unit in cubic metres.
    pub fn in_cubic_metres(self) -> f64 {
        match self {
            // 1 L = 1e-3 m^3
            VolumeUnit::Litre(scale) => scale * 1e-3,
            VolumeUnit::Cubic(l) => l.in_metres().powi(3),
        }
    }
}

impl FromStr for VolumeUnit {
    type Err = PixelSimError;

    fn from_str(s: &str) -> Result<Self> {
        let litre = |scale| Ok(VolumeUnit::Litre(scale));
        match s {
            "L" => litre(1.0),
            "dL" => litre(1e-1),
            "cL" => litre(1e-2),
            "mL" => litre(1e-3),
            "uL" => litre(1e-6),
            "nL" => litre(1e-9),
            "pL" => litre(1e-12),
            "fL" => litre(1e-15),
            cubic => match cubic.strip_suffix('3') {
                Some(length) => Ok(VolumeUnit::Cubic(length.parse()?)),
                None => Err(PixelSimError::Configuration(format!("unsupported volume unit '{}'", cubic))),
            },
        }
    }
}

/// `[volume] / [length]^3`: multiplies a membrane flux (amount per area per time)
/// so that dividing by a voxel length gives a concentration rate.
pub fn vol_over_l3(length: LengthUnit, volume: VolumeUnit) -> f64 {
    volume.in_cubic_metres() / length.in_metres().powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!("um".parse::<LengthUnit>().unwrap(), LengthUnit::Micrometre);
        assert_eq!("mm3".parse::<VolumeUnit>().unwrap(), VolumeUnit::Cubic(LengthUnit::Millimetre));
        assert!("furlong".parse::<LengthUnit>().is_err());
        assert!("gallon".parse::<VolumeUnit>().is_err());
    }

    #[test]
    fn conversion_factor() {
        let f = vol_over_l3(LengthUnit::Micrometre, VolumeUnit::Cubic(LengthUnit::Micrometre));
        assert!((f - 1.0).abs() < 1e-12);
        // 1 fL == 1 um^3
        let f = vol_over_l3(LengthUnit::Micrometre, "fL".parse().unwrap());
        assert!((f - 1.0).abs() < 1e-9);
        // 1 mL == 1 cm^3 == 1e3 mm^3
        let f = vol_over_l3(LengthUnit::Millimetre, "mL".parse().unwrap());
        assert!((f - 1e3).abs() < 1e-9);
    }
}
