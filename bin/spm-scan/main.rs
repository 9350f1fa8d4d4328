use chrono::Utc;
use clap::Parser;
use crossbeam_channel::Receiver;
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use std::{fs, path::Path, path::PathBuf, sync::Arc};

use spm_scan::{
    AppConfig, ExecutionStatus, Logger, ProbeMode, SampleLogger, ScanEvent, ScanExecutor,
    SpmError, load_config,
};

/// Scanning probe microscope scan runner
#[derive(Parser, Debug)]
#[command(name = "spm-scan")]
#[command(
    about = "Run an STM/AFM/profiling scan on simulated or serial hardware",
    long_about = None
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Probe mode (stm, afm_contact, afm_non_contact, profiling)
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<ProbeMode>,

    /// Force the simulated backend
    #[arg(long, conflicts_with = "port")]
    simulate: bool,

    /// Serial port of the motion controller; implies hardware mode
    #[arg(short, long, value_name = "PORT")]
    port: Option<String>,

    /// Grid points per axis
    #[arg(short, long)]
    resolution: Option<usize>,

    /// Square scan size in micrometers
    #[arg(long, value_name = "UM")]
    scan_size: Option<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let loaded = load_config(args.config.as_deref()).map_err(SpmError::from);
    let (mut config, fallback) = startup_config(args.config.is_some(), loaded)?;
    apply_overrides(&mut config, &args);

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);
    report_config_fallback(fallback.as_ref());

    config.validate()?;
    log_startup_info(&config, args.config.as_deref());

    let scan_config = config.to_scan_config()?;
    let factory = config.to_factory()?;
    let executor = Arc::new(ScanExecutor::new(scan_config.clone()));
    setup_shutdown_handler(Arc::clone(&executor))?;

    let events = executor.subscribe();
    let sample_log = create_sample_log(&config)?;

    executor.start(factory.build_strategy(&scan_config))?;
    run_and_report(&executor, events, sample_log)
}

fn parse_mode(value: &str) -> Result<ProbeMode, String> {
    match value.to_lowercase().replace('-', "_").as_str() {
        "stm" => Ok(ProbeMode::Stm),
        "afm_contact" | "contact" => Ok(ProbeMode::AfmContact),
        "afm_non_contact" | "non_contact" => Ok(ProbeMode::AfmNonContact),
        "profiling" | "profile" => Ok(ProbeMode::Profiling),
        other => Err(format!("unknown probe mode '{other}'")),
    }
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(mode) = args.mode {
        config.scan.mode = mode;
    }
    if let Some(resolution) = args.resolution {
        config.scan.resolution = resolution;
    }
    if let Some(size) = args.scan_size {
        config.scan.x_range = size;
        config.scan.y_range = size;
    }
    if args.simulate {
        config.motion.simulate = true;
    }
    if let Some(port) = &args.port {
        config.motion.simulate = false;
        config.motion.port = Some(port.clone());
    }
}

/// An explicitly requested file must load. A default file that fails falls
/// back to defaults; the error is kept for reporting once logging is up.
fn startup_config(
    explicit: bool,
    loaded: Result<AppConfig, SpmError>,
) -> Result<(AppConfig, Option<SpmError>), SpmError> {
    match loaded {
        Ok(config) => Ok((config, None)),
        Err(e) if explicit => Err(e),
        Err(e) => Ok((AppConfig::default(), Some(e))),
    }
}

fn report_config_fallback(error: Option<&SpmError>) {
    if let Some(e) = error {
        warn!("Failed to load config ({}), using defaults", e);
    }
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== SPM Scan ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!(
        "Mode: {}, range {}x{} um, resolution {}",
        config.scan.mode, config.scan.x_range, config.scan.y_range, config.scan.resolution
    );
    info!(
        "Z gains: kp={} ki={} kd={} ({:?})",
        config.controller.kp,
        config.controller.ki,
        config.controller.kd,
        config.controller.regulation
    );
    if config.motion.simulate {
        info!(
            "Backend: simulated ({:?} surface, {} ms per move)",
            config.surface.topography, config.motion.step_delay_ms
        );
    } else {
        info!(
            "Backend: serial {} @ {} baud",
            config.motion.port.as_deref().unwrap_or("?"),
            config.motion.baud_rate
        );
    }
}

/// Setup Ctrl+C handler that stops the scan gracefully
fn setup_shutdown_handler(
    executor: Arc<ScanExecutor>,
) -> Result<(), Box<dyn std::error::Error>> {
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping scan...");
        if let Err(e) = executor.stop() {
            warn!("Stop request ignored: {}", e);
        }
    })?;
    Ok(())
}

fn create_sample_log(
    config: &AppConfig,
) -> Result<Option<SampleLogger>, Box<dyn std::error::Error>> {
    let logging = &config.experiment_logging;
    if !logging.enabled {
        return Ok(None);
    }
    let path = create_log_file_path(&logging.output_path, config.scan.mode)?;
    info!("Sample log: {}", path.display());
    Ok(Some(Logger::new(
        path,
        logging.buffer_size,
        logging.final_format_json,
    )))
}

/// Follow scan events until the scan ends, then report results
fn run_and_report(
    executor: &ScanExecutor,
    events: Receiver<ScanEvent>,
    mut sample_log: Option<SampleLogger>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, total) = executor.progress();
    let report_every = (total / 10).max(1);

    for event in events.iter() {
        match event {
            ScanEvent::Progress {
                completed, sample, ..
            } => {
                if let Some(log) = sample_log.as_mut() {
                    log.add(sample)?;
                }
                if completed % report_every == 0 || completed == total {
                    info!(
                        "Progress: {}/{} ({:.0}%)",
                        completed,
                        total,
                        100.0 * completed as f64 / total as f64
                    );
                }
            }
            ScanEvent::StatusChanged(status) if status.is_terminal() => break,
            ScanEvent::StatusChanged(status) => info!("Scan {}", status),
        }
    }

    if let Some(mut log) = sample_log.take() {
        log.finalize()?;
    }

    let status = executor.get_status();
    let data = executor.get_data();
    let (min, max) = executor
        .height_map()
        .iter()
        .filter(|z| z.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| {
            (lo.min(z), hi.max(z))
        });

    match &status {
        ExecutionStatus::Completed => {
            info!("✓ Scan completed: {} samples", data.len());
            if !data.is_empty() {
                info!("Z range: {:.4} .. {:.4}", min, max);
            }
            Ok(())
        }
        ExecutionStatus::Aborted => {
            info!("✓ Scan stopped by user after {}/{} samples", data.len(), total);
            Ok(())
        }
        ExecutionStatus::Failed(reason) => {
            error!("✗ Scan failed after {} samples: {}", data.len(), reason);
            Err(reason.clone().into())
        }
        other => {
            error!("✗ Event stream ended while scan was {}", other);
            Err(format!("scan ended in unexpected state {other}").into())
        }
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_log_file_path(
    log_path: &str,
    mode: ProbeMode,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    fs::create_dir_all(&history_dir)?;

    let mode = serde_json::to_value(mode)?;
    let filename = format!(
        "scan_{}_{}.jsonl",
        mode.as_str().unwrap_or("unknown"),
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    Ok(history_dir.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config_error_is_fatal() {
        let loaded = Err(SpmError::Configuration("expected a table".to_string()));
        assert!(startup_config(true, loaded).is_err());
    }

    #[test]
    fn test_default_config_error_is_kept() {
        let loaded = Err(SpmError::Configuration("expected a table".to_string()));
        let (config, fallback) = startup_config(false, loaded).unwrap();

        assert_eq!(config.scan.resolution, AppConfig::default().scan.resolution);
        assert!(matches!(fallback, Some(SpmError::Configuration(_))));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(parse_mode("afm-contact"), Ok(ProbeMode::AfmContact));
        assert_eq!(parse_mode("STM"), Ok(ProbeMode::Stm));
        assert!(parse_mode("tapping").is_err());
    }
}
