use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info};
use pixelsim::{Model, PixelIntegratorType, PixelSim};
use pixelsim_common::{AvgMinMax, CompartmentStats, SimulationConfig, Snapshot};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Command-line arguments for the pixel integrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Simulation config file path (.toml)
    config: PathBuf,

    /// Worker threads, 0 for all available. Enables multithreading.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Integration scheme, overriding the config: rk101, rk212, rk323 or rk435
    #[arg(short, long, value_parser = parse_integrator)]
    integrator: Option<PixelIntegratorType>,
}

fn parse_integrator(s: &str) -> std::result::Result<PixelIntegratorType, String> {
    match s.to_ascii_lowercase().as_str() {
        "rk101" => Ok(PixelIntegratorType::Rk101),
        "rk212" => Ok(PixelIntegratorType::Rk212),
        "rk323" => Ok(PixelIntegratorType::Rk323),
        "rk435" => Ok(PixelIntegratorType::Rk435),
        other => Err(format!("unknown integrator '{}'", other)),
    }
}

fn compartment_stats(sim: &PixelSim) -> Vec<CompartmentStats> {
    sim.compartments()
        .iter()
        .map(|comp| {
            let n = comp.n_species();
            CompartmentStats {
                compartment_id: comp.compartment_id().to_string(),
                species_ids: comp.species_ids().to_vec(),
                species: (0..n)
                    .map(|s| AvgMinMax::from_values(comp.concentrations().iter().skip(s).step_by(n).copied()))
                    .collect(),
            }
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting pixel simulation...");
    let mut config = SimulationConfig::load(&args.config)?;
    if let Some(threads) = args.threads {
        config.integrator.enable_multithreading = true;
        config.integrator.max_threads = threads;
    }
    if let Some(integrator) = args.integrator {
        config.integrator.integrator = integrator;
    }
    debug!("Integrator options: {:#?}", config.integrator);

    let model = Model::from_config(&config)?;
    let mut sim = PixelSim::new(&model, &config.integrator)?;

    let timing = &config.timing;
    let n_records = (timing.simulation_time / timing.record_interval).ceil().max(0.0) as u64;
    info!(
        "Simulating {} time units, recording every {} ({} snapshots)",
        timing.simulation_time, timing.record_interval, n_records
    );

    let mut snapshots = vec![Snapshot {
        time: 0.0,
        steps: 0,
        discarded_steps: 0,
        elapsed_ms: 0.0,
        compartments: compartment_stats(&sim),
        error: None,
    }];

    let progress_bar = ProgressBar::new(n_records);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} snapshots ({percent}%) [{eta}] {msg}")?
            .progress_chars("#>-"),
    );

    let start_time = Instant::now();
    let mut t = 0.0;
    for _ in 0..n_records {
        let interval = timing.record_interval.min(timing.simulation_time - t);
        let timeout_ms = if timing.timeout_ms >= 0.0 {
            (timing.timeout_ms - start_time.elapsed().as_secs_f64() * 1000.0).max(0.0)
        } else {
            -1.0
        };
        let chunk_start = Instant::now();
        let result = sim.run(interval, timeout_ms);
        let (steps, error) = match result {
            Ok(steps) => (steps, None),
            Err(e) => (e.steps(), Some(e.to_string())),
        };
        t += interval;
        snapshots.push(Snapshot {
            time: t,
            steps,
            discarded_steps: sim.discarded_steps(),
            elapsed_ms: chunk_start.elapsed().as_secs_f64() * 1000.0,
            compartments: compartment_stats(&sim),
            error: error.clone(),
        });
        progress_bar.set_message(format!("t = {:.4}", t));
        progress_bar.inc(1);
        if let Some(e) = error {
            progress_bar.abandon_with_message(format!("stopped at t = {:.4}", t));
            error!("Simulation stopped at t = {}: {}", t, e);
            break;
        }
    }
    if !progress_bar.is_finished() {
        progress_bar.finish_with_message("done");
    }

    let total_duration = start_time.elapsed();
    info!("Simulation finished in {:.3} seconds.", total_duration.as_secs_f64());

    if config.output.save_stats {
        let filename = format!("{}_snapshots.json", config.output.base_filename);
        let json_string = serde_json::to_string(&snapshots)
            .map_err(|e| anyhow::anyhow!("Error serializing snapshots to JSON: {}", e))?;
        let mut file = File::create(&filename)
            .map_err(|e| anyhow::anyhow!("Error creating snapshot file '{}': {}", filename, e))?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| anyhow::anyhow!("Error writing snapshot JSON to file '{}': {}", filename, e))?;
        info!("All snapshots saved to {}", filename);
    } else {
        info!("Skipping saving snapshots as per config (save_stats is false).");
    }
    Ok(())
}
