use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::options::PixelOptions;
use crate::voxel::{Volume, VoxelSize};
use std::collections::BTreeMap;
use std::path::Path;

/// Maps one character of the geometry image to a compartment.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CompartmentLabel {
    pub id: String,
    pub label: char,
}

// Geometry of the model: a labelled image stack plus physical voxel size
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GeometryConfig {
    #[serde(default)]
    pub voxel_size: VoxelSize,
    #[serde(default = "default_length_unit")]
    pub length_unit: String,
    #[serde(default = "default_volume_unit")]
    pub volume_unit: String,
    /// Rows of a single 2-D layer, first row is y = 0.
    #[serde(default)]
    pub image: Vec<String>,
    /// One entry per z layer, for 3-D geometries. Takes precedence over `image`.
    #[serde(default)]
    pub layers: Vec<Vec<String>>,
    pub compartments: Vec<CompartmentLabel>,
}

impl GeometryConfig {
    /// The image layers, whichever of `layers` or `image` was given.
    pub fn image_layers(&self) -> Vec<Vec<String>> {
        if self.layers.is_empty() {
            vec![self.image.clone()]
        } else {
            self.layers.clone()
        }
    }

    /// Dimensions of the image stack in voxels.
    pub fn volume(&self) -> Volume {
        let layers = self.image_layers();
        let height = layers.first().map_or(0, |l| l.len());
        let width = layers
            .first()
            .and_then(|l| l.first())
            .map_or(0, |row| row.chars().count());
        Volume::new(width, height, layers.len())
    }
}

// A species living in one compartment
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SpeciesConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub compartment: String,
    #[serde(default)]
    pub diffusion_constant: f64,
    #[serde(default)]
    pub initial_concentration: f64,
    #[serde(default = "default_is_spatial")]
    pub is_spatial: bool,
    /// Standard deviation of Gaussian noise added to the initial concentration.
    #[serde(default)]
    pub noise: f64,
}

// A reaction in a compartment or a membrane (membrane ids are "<A>_<B>")
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReactionConfig {
    pub id: String,
    pub location: String,
    pub expression: String,
    #[serde(default)]
    pub stoichiometry: BTreeMap<String, f64>,
}

// Configuration for timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    pub simulation_time: f64,
    pub record_interval: f64,
    /// Wall-clock limit for the whole run, negative means no limit.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct InitialConditions {
    #[serde(default)]
    pub seed: u64,
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
    #[serde(default)]
    pub save_stats: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            base_filename: default_base_filename(),
            save_stats: false,
        }
    }
}

// Main simulation configuration structure, loaded from a TOML file.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub geometry: GeometryConfig,
    pub species: Vec<SpeciesConfig>,
    #[serde(default)]
    pub reactions: Vec<ReactionConfig>,
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub integrator: PixelOptions,
    pub timing: TimingConfig,
    #[serde(default)]
    pub initial_conditions: InitialConditions,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Ids of every membrane implied by the compartment list, "<A>_<B>" for A listed before B.
    pub fn possible_membrane_ids(&self) -> Vec<String> {
        let comps = &self.geometry.compartments;
        let mut ids = Vec::new();
        for (i, a) in comps.iter().enumerate() {
            for b in &comps[i + 1..] {
                ids.push(format!("{}_{}", a.id, b.id));
            }
        }
        ids
    }

    fn validate(&self) -> Result<()> {
        let geometry = &self.geometry;
        let layers = geometry.image_layers();
        let volume = geometry.volume();
        if volume.n_voxels() == 0 {
            anyhow::bail!("geometry image must not be empty.");
        }
        for (z, layer) in layers.iter().enumerate() {
            if layer.len() != volume.height {
                anyhow::bail!("layer {} has {} rows, expected {}.", z, layer.len(), volume.height);
            }
            if let Some(row) = layer.iter().find(|row| row.chars().count() != volume.width) {
                anyhow::bail!("row '{}' in layer {} does not have width {}.", row, z, volume.width);
            }
        }
        let vs = geometry.voxel_size;
        if !(vs.width > 0.0 && vs.height > 0.0 && vs.depth > 0.0) {
            anyhow::bail!("voxel_size components must be positive.");
        }
        if geometry.compartments.is_empty() {
            anyhow::bail!("at least one compartment must be defined.");
        }
        let has_compartment = |id: &str| geometry.compartments.iter().any(|c| c.id == id);
        for s in &self.species {
            if !has_compartment(&s.compartment) {
                anyhow::bail!("species '{}' is in unknown compartment '{}'.", s.id, s.compartment);
            }
            if s.diffusion_constant < 0.0 {
                anyhow::bail!("species '{}' has a negative diffusion constant.", s.id);
            }
            if s.noise < 0.0 {
                anyhow::bail!("species '{}' has negative noise.", s.id);
            }
        }
        let membrane_ids = self.possible_membrane_ids();
        for r in &self.reactions {
            if !has_compartment(&r.location) && !membrane_ids.contains(&r.location) {
                anyhow::bail!("reaction '{}' has unknown location '{}'.", r.id, r.location);
            }
            if let Some(s) = r.stoichiometry.keys().find(|s| !self.species.iter().any(|sp| &sp.id == *s)) {
                anyhow::bail!("reaction '{}' refers to unknown species '{}'.", r.id, s);
            }
        }
        if self.timing.simulation_time < 0.0 {
            anyhow::bail!("simulation_time must not be negative.");
        }
        if self.timing.record_interval <= 0.0 {
            anyhow::bail!("record_interval must be positive.");
        }
        Ok(())
    }
}

fn default_length_unit() -> String {
    "um".to_string()
}

fn default_volume_unit() -> String {
    "um3".to_string()
}

fn default_is_spatial() -> bool {
    true
}

fn default_timeout_ms() -> f64 {
    -1.0
}

fn default_base_filename() -> String {
    "pixelsim".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PixelIntegratorType;

    const CONFIG: &str = r#"
        [geometry]
        voxel_size = { width = 0.5, height = 0.5, depth = 1.0 }
        image = ["AAB", "AAB"]
        compartments = [ { id = "cell", label = "A" }, { id = "nucleus", label = "B" } ]

        [[species]]
        id = "u"
        compartment = "cell"
        diffusion_constant = 1.0
        initial_concentration = 2.0

        [[species]]
        id = "v"
        compartment = "nucleus"
        is_spatial = false

        [[reactions]]
        id = "transport"
        location = "cell_nucleus"
        expression = "k * u"
        stoichiometry = { u = -1.0, v = 1.0 }

        [parameters]
        k = 0.1

        [integrator]
        integrator = "rk323"
        max_err = { rel = 0.01 }

        [timing]
        simulation_time = 10.0
        record_interval = 1.0
    "#;

    #[test]
    fn parses_config_with_defaults() {
        let config = SimulationConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.geometry.volume(), Volume::new(3, 2, 1));
        assert_eq!(config.species.len(), 2);
        assert!(!config.species[1].is_spatial);
        assert_eq!(config.integrator.integrator, PixelIntegratorType::Rk323);
        assert_eq!(config.integrator.max_err.rel, 0.01);
        assert_eq!(config.integrator.max_err.abs, f64::MAX);
        assert_eq!(config.timing.timeout_ms, -1.0);
        assert_eq!(config.geometry.length_unit, "um");
        assert_eq!(config.possible_membrane_ids(), vec!["cell_nucleus".to_string()]);
    }

    #[test]
    fn rejects_unknown_reaction_location() {
        let bad = CONFIG.replace("location = \"cell_nucleus\"", "location = \"nowhere\"");
        let err = SimulationConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("unknown location"));
    }

    #[test]
    fn rejects_ragged_image() {
        let bad = CONFIG.replace("image = [\"AAB\", \"AAB\"]", "image = [\"AAB\", \"AA\"]");
        assert!(SimulationConfig::from_toml_str(&bad).is_err());
    }
}
