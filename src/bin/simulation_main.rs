// simulation_main.rs
use log::{error, info};
use signal_coordination::config::Config;
use signal_coordination::monitoring::{CsvMetricsSink, MetricsSink};
use signal_coordination::simulation_engine::run_simulation;
use std::env;
use std::process::ExitCode;

const DEFAULT_TICKS: u64 = 300;

fn load_config() -> Result<Config, signal_coordination::error::ConfigError> {
    match env::args().nth(1).or_else(|| env::var("SIGNAL_CONFIG").ok()) {
        Some(path) => {
            info!("Loading config from {}", path);
            Config::from_toml_file(path)
        }
        None => {
            info!("No config given; using the built-in two-intersection corridor");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let ticks = env::var("SIM_TICKS")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_TICKS);

    let mut sinks: Vec<Box<dyn MetricsSink>> = Vec::new();
    if let Some(path) = &config.metrics_csv {
        sinks.push(Box::new(CsvMetricsSink::new(path)));
    }

    match run_simulation(&config, ticks, sinks).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => info!("Simulation report:\n{}", json),
                Err(e) => error!("Could not serialize report: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Simulation failed to start: {}", e);
            ExitCode::FAILURE
        }
    }
}
