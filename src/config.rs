use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SpmError;
use crate::motion::{BackendHandle, SerialBackend, SerialSettings, SimulatedBackend};
use crate::scan::HardwareFactory;
use crate::surface::{SurfaceModel, Topography};
use crate::types::{ProbeMode, RegulationMode, ScanAxis, ScanConfig};
use crate::z_control::PidGains;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub scan: ScanSettings,
    pub controller: ControllerSettings,
    pub motion: MotionSettings,
    pub surface: SurfaceSettings,
    pub experiment_logging: ExperimentLoggingConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanSettings {
    pub mode: ProbeMode,
    /// Micrometers
    pub x_range: f64,
    pub y_range: f64,
    /// Grid points per axis
    pub resolution: usize,
    /// Overrides the mode's default setpoint
    pub setpoint: Option<f64>,
    pub feed_rate: Option<f64>,
    pub profile_axis: ScanAxis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub regulation: RegulationMode,
    pub integral_limit: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionSettings {
    pub simulate: bool,
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub settle_time_ms: u64,
    /// Per-move latency of the simulated backend
    pub step_delay_ms: u64,
    pub signal_query: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SurfaceSettings {
    pub topography: Topography,
    pub amplitude: f64,
    pub noise: f64,
    /// Fixed seed for reproducible surfaces; random when absent
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExperimentLoggingConfig {
    pub enabled: bool,
    pub output_path: String,
    pub buffer_size: usize,
    /// Rewrite the JSONL sample log as a JSON array when the scan ends
    pub final_format_json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ProbeMode::Stm,
            x_range: 10.0,
            y_range: 10.0,
            resolution: 100,
            setpoint: None,
            feed_rate: None,
            profile_axis: ScanAxis::X,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        let gains = PidGains::default();
        Self {
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            regulation: RegulationMode::default(),
            integral_limit: None,
        }
    }
}

impl Default for MotionSettings {
    fn default() -> Self {
        let serial = SerialSettings::default();
        Self {
            simulate: true,
            port: None,
            baud_rate: serial.baud_rate,
            read_timeout_ms: serial.read_timeout.as_millis() as u64,
            settle_time_ms: serial.settle_time.as_millis() as u64,
            step_delay_ms: 10,
            signal_query: serial.signal_query,
        }
    }
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            topography: Topography::default(),
            amplitude: 1.0,
            noise: 0.0,
            seed: None,
        }
    }
}

impl Default for ExperimentLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_path: "./scans".to_string(),
            buffer_size: 1000,
            final_format_json: false,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Reject settings no scan could run with
    pub fn validate(&self) -> Result<(), SpmError> {
        self.to_scan_config()?;
        if !self.motion.simulate && self.motion.port.as_deref().is_none_or(str::is_empty) {
            return Err(SpmError::Configuration(
                "hardware mode requires motion.port".to_string(),
            ));
        }
        if self.motion.baud_rate == 0 {
            return Err(SpmError::Configuration(
                "motion.baud_rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_scan_config(&self) -> Result<ScanConfig, SpmError> {
        let scan = &self.scan;
        let mut builder = ScanConfig::builder(scan.mode)
            .x_range(scan.x_range)
            .y_range(scan.y_range)
            .resolution(scan.resolution)
            .profile_axis(scan.profile_axis);
        if let Some(setpoint) = scan.setpoint {
            builder = builder.setpoint(setpoint);
        }
        if let Some(feed_rate) = scan.feed_rate {
            builder = builder.feed_rate(feed_rate);
        }
        builder.build()
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.motion.port.clone(),
            baud_rate: self.motion.baud_rate,
            read_timeout: Duration::from_millis(self.motion.read_timeout_ms),
            settle_time: Duration::from_millis(self.motion.settle_time_ms),
            signal_query: self.motion.signal_query.clone(),
        }
    }

    pub fn surface_model(&self) -> SurfaceModel {
        let surface = &self.surface;
        let model = SurfaceModel::new(surface.topography, self.scan.x_range, self.scan.y_range)
            .with_amplitude(surface.amplitude)
            .with_noise(surface.noise);
        match surface.seed {
            Some(seed) => model.with_seed(seed),
            None => model,
        }
    }

    /// Backend, signal source and controller settings for this configuration
    pub fn to_factory(&self) -> Result<HardwareFactory, SpmError> {
        self.validate()?;
        let factory = if self.motion.simulate {
            let backend = BackendHandle::new(SimulatedBackend::new(Duration::from_millis(
                self.motion.step_delay_ms,
            )));
            HardwareFactory::simulated(backend, self.surface_model())
        } else {
            HardwareFactory::hardware(BackendHandle::new(SerialBackend::new(
                self.serial_settings(),
            )))
        };

        let controller = &self.controller;
        Ok(factory
            .with_gains(PidGains::new(controller.kp, controller.ki, controller.kd))
            .with_regulation(controller.regulation)
            .with_integral_limit(controller.integral_limit))
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["spm_scan.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // e.g. SPM_SCAN__SCAN__RESOLUTION=64
    builder = builder.add_source(
        Environment::with_prefix("SPM_SCAN")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}
