use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SpmError;

/// Lateral tip position in micrometers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Full three-axis position as last commanded to a motion backend
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Overwrite only the axes present in `targets`
    pub fn apply(&mut self, targets: &AxisTargets) {
        if let Some(x) = targets.x {
            self.x = x;
        }
        if let Some(y) = targets.y {
            self.y = y;
        }
        if let Some(z) = targets.z {
            self.z = z;
        }
    }
}

/// Sparse absolute move request. Omitted axes keep their last commanded value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisTargets {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub feed_rate: Option<f64>,
}

impl AxisTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn xy(position: Position) -> Self {
        Self {
            x: Some(position.x),
            y: Some(position.y),
            ..Self::default()
        }
    }

    pub fn z(z: f64) -> Self {
        Self {
            z: Some(z),
            ..Self::default()
        }
    }

    pub fn with_x(mut self, x: f64) -> Self {
        self.x = Some(x);
        self
    }

    pub fn with_y(mut self, y: f64) -> Self {
        self.y = Some(y);
        self
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn with_feed_rate(mut self, feed_rate: Option<f64>) -> Self {
        self.feed_rate = feed_rate;
        self
    }

    /// True when no axis would move
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAxis {
    #[default]
    X,
    Y,
}

/// Instrument mode a scan is run in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    #[default]
    Stm,
    AfmContact,
    AfmNonContact,
    Profiling,
}

impl ProbeMode {
    /// Setpoint used when the configuration does not name one
    /// (tunneling current in nA, deflection, amplitude, height)
    pub fn default_setpoint(&self) -> f64 {
        match self {
            ProbeMode::Stm => 1.0,
            ProbeMode::AfmContact => 1.0,
            ProbeMode::AfmNonContact => 0.8,
            ProbeMode::Profiling => 1.0,
        }
    }

    /// Area modes raster a 2D grid, profiling sweeps a single line
    pub fn is_area(&self) -> bool {
        !matches!(self, ProbeMode::Profiling)
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeMode::Stm => "STM",
            ProbeMode::AfmContact => "AFM contact",
            ProbeMode::AfmNonContact => "AFM non-contact",
            ProbeMode::Profiling => "profiling",
        };
        write!(f, "{name}")
    }
}

/// How the Z controller output is turned into a Z command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulationMode {
    /// Output is added to the previous Z position (feedback tracks the surface)
    #[default]
    ConstantCurrent,
    /// Output is used as the Z position directly
    ConstantHeight,
}

/// Frozen per-scan configuration. Build through [`ScanConfig::builder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanConfig {
    mode: ProbeMode,
    x_range: f64,
    y_range: f64,
    resolution: usize,
    setpoint: f64,
    feed_rate: Option<f64>,
    profile_axis: ScanAxis,
}

impl ScanConfig {
    pub fn builder(mode: ProbeMode) -> ScanConfigBuilder {
        ScanConfigBuilder {
            mode,
            x_range: 10.0,
            y_range: 10.0,
            resolution: 100,
            setpoint: None,
            feed_rate: None,
            profile_axis: ScanAxis::X,
        }
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    pub fn x_range(&self) -> f64 {
        self.x_range
    }

    pub fn y_range(&self) -> f64 {
        self.y_range
    }

    /// Grid points per axis
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn feed_rate(&self) -> Option<f64> {
        self.feed_rate
    }

    pub fn profile_axis(&self) -> ScanAxis {
        self.profile_axis
    }

    /// Length of the single sweep in profiling mode
    pub fn profile_range(&self) -> f64 {
        match self.profile_axis {
            ScanAxis::X => self.x_range,
            ScanAxis::Y => self.y_range,
        }
    }

    /// Number of samples a completed scan produces
    pub fn expected_samples(&self) -> usize {
        if self.mode.is_area() {
            self.resolution * self.resolution
        } else {
            self.resolution
        }
    }
}

pub struct ScanConfigBuilder {
    mode: ProbeMode,
    x_range: f64,
    y_range: f64,
    resolution: usize,
    setpoint: Option<f64>,
    feed_rate: Option<f64>,
    profile_axis: ScanAxis,
}

impl ScanConfigBuilder {
    pub fn x_range(mut self, range: f64) -> Self {
        self.x_range = range;
        self
    }

    pub fn y_range(mut self, range: f64) -> Self {
        self.y_range = range;
        self
    }

    /// Square scan area
    pub fn scan_size(mut self, size: f64) -> Self {
        self.x_range = size;
        self.y_range = size;
        self
    }

    pub fn resolution(mut self, points: usize) -> Self {
        self.resolution = points;
        self
    }

    pub fn setpoint(mut self, setpoint: f64) -> Self {
        self.setpoint = Some(setpoint);
        self
    }

    pub fn feed_rate(mut self, feed_rate: f64) -> Self {
        self.feed_rate = Some(feed_rate);
        self
    }

    pub fn profile_axis(mut self, axis: ScanAxis) -> Self {
        self.profile_axis = axis;
        self
    }

    pub fn build(self) -> Result<ScanConfig, SpmError> {
        if self.resolution == 0 {
            return Err(SpmError::Configuration(
                "resolution must be greater than zero".to_string(),
            ));
        }
        if self.mode.is_area() && self.resolution.checked_mul(self.resolution).is_none() {
            return Err(SpmError::Configuration(format!(
                "resolution {} is too large for an area scan",
                self.resolution
            )));
        }
        for (name, range) in [("x_range", self.x_range), ("y_range", self.y_range)] {
            if !(range.is_finite() && range > 0.0) {
                return Err(SpmError::Configuration(format!(
                    "{name} must be a positive number, got {range}"
                )));
            }
        }
        if let Some(feed_rate) = self.feed_rate {
            if !(feed_rate.is_finite() && feed_rate > 0.0) {
                return Err(SpmError::Configuration(format!(
                    "feed_rate must be positive, got {feed_rate}"
                )));
            }
        }
        let setpoint = self.setpoint.unwrap_or_else(|| self.mode.default_setpoint());
        if !setpoint.is_finite() {
            return Err(SpmError::Configuration(format!(
                "setpoint must be finite, got {setpoint}"
            )));
        }

        Ok(ScanConfig {
            mode: self.mode,
            x_range: self.x_range,
            y_range: self.y_range,
            resolution: self.resolution,
            setpoint,
            feed_rate: self.feed_rate,
            profile_axis: self.profile_axis,
        })
    }
}

/// One measured point of a scan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    pub x: f64,
    pub y: f64,
    pub z_corrected: f64,
    pub raw_signal: f64,
    pub timestamp: DateTime<Utc>,
}

impl ScanSample {
    pub fn new(position: Position, z_corrected: f64, raw_signal: f64) -> Self {
        Self {
            x: position.x,
            y: position.y,
            z_corrected,
            raw_signal,
            timestamp: Utc::now(),
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

/// Lifecycle state of a [`crate::ScanExecutor`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed(String),
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Aborted | ExecutionStatus::Failed(_)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Paused)
    }

    /// Failure reason, present only for `Failed`
    pub fn reason(&self) -> Option<&str> {
        match self {
            ExecutionStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Idle => write!(f, "idle"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Paused => write!(f, "paused"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
            ExecutionStatus::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Result of one strategy step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Running,
    Done,
}

/// Snapshot reported by a motion backend for connection indicators
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BackendState {
    pub connected: bool,
    pub position: Position3D,
    pub feed_rate: Option<f64>,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
}
