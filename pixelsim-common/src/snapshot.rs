use serde::{Serialize, Deserialize};

/// Average, minimum and maximum of one species over a compartment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvgMinMax {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl AvgMinMax {
    /// Statistics of `values`, or all zeros if it is empty.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for v in values {
            n += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if n == 0 {
            return AvgMinMax { avg: 0.0, min: 0.0, max: 0.0 };
        }
        AvgMinMax { avg: sum / n as f64, min, max }
    }
}

/// Per-species statistics for one compartment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompartmentStats {
    pub compartment_id: String,
    pub species_ids: Vec<String>,
    pub species: Vec<AvgMinMax>,
}

/// A snapshot of the simulation state and metrics at a specific time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The simulated time at which the snapshot was taken.
    pub time: f64,
    /// Accepted integrator steps since the previous snapshot.
    pub steps: usize,
    /// Steps rejected by the adaptive controller since the previous snapshot.
    pub discarded_steps: usize,
    /// Wall-clock time spent integrating since the previous snapshot.
    pub elapsed_ms: f64,
    pub compartments: Vec<CompartmentStats>,
    /// Non-empty if the run stopped before reaching `time`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
