use log::info;

use crate::motion::SharedBackend;
use crate::scan::modes::{AfmContactMode, AfmNonContactMode, ProfilingMode, StmMode};
use crate::scan::ScanModeStrategy;
use crate::surface::SurfaceModel;
use crate::types::{ProbeMode, RegulationMode, ScanConfig};
use crate::z_control::{PidGains, ZAxisController};

/// Where a strategy reads its probe signal from
#[derive(Debug, Clone)]
pub enum SignalSource {
    /// Synthetic surface evaluated at the commanded position
    Surface(SurfaceModel),
    /// Live reading from the motion backend
    Backend,
}

impl SignalSource {
    pub fn is_simulated(&self) -> bool {
        matches!(self, SignalSource::Surface(_))
    }
}

/// Everything a strategy needs to talk to the instrument
pub struct ScanHardware {
    pub backend: SharedBackend,
    pub signal: SignalSource,
    pub controller: ZAxisController,
}

/// Builds strategies wired to one backend
///
/// Simulated and hardware scans differ only in the [`SignalSource`] handed to
/// the strategy; the motion path is identical.
#[derive(Clone)]
pub struct HardwareFactory {
    backend: SharedBackend,
    signal: SignalSource,
    gains: PidGains,
    regulation: RegulationMode,
    integral_limit: Option<f64>,
}

impl HardwareFactory {
    pub fn simulated(backend: SharedBackend, surface: SurfaceModel) -> Self {
        Self::with_signal(backend, SignalSource::Surface(surface))
    }

    pub fn hardware(backend: SharedBackend) -> Self {
        Self::with_signal(backend, SignalSource::Backend)
    }

    fn with_signal(backend: SharedBackend, signal: SignalSource) -> Self {
        Self {
            backend,
            signal,
            gains: PidGains::default(),
            regulation: RegulationMode::default(),
            integral_limit: None,
        }
    }

    pub fn with_gains(mut self, gains: PidGains) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_regulation(mut self, regulation: RegulationMode) -> Self {
        self.regulation = regulation;
        self
    }

    pub fn with_integral_limit(mut self, limit: Option<f64>) -> Self {
        self.integral_limit = limit;
        self
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub fn is_simulated(&self) -> bool {
        self.signal.is_simulated()
    }

    /// Fresh controller and signal source for `mode`, sharing this factory's backend
    pub fn assemble(&self, mode: ProbeMode) -> ScanHardware {
        let mut controller =
            ZAxisController::new(self.gains, mode.default_setpoint(), self.regulation);
        if let Some(limit) = self.integral_limit {
            controller = controller.with_integral_limit(limit);
        }
        ScanHardware {
            backend: self.backend.clone(),
            signal: self.signal.clone(),
            controller,
        }
    }

    /// Strategy matching the mode of `config`
    pub fn build_strategy(&self, config: &ScanConfig) -> Box<dyn ScanModeStrategy> {
        let mode = config.mode();
        let hardware = self.assemble(mode);
        info!(
            "Building {mode} strategy on {} ({})",
            self.backend.name(),
            if self.is_simulated() { "simulated signal" } else { "live signal" }
        );
        match mode {
            ProbeMode::Stm => Box::new(StmMode::new(hardware)),
            ProbeMode::AfmContact => Box::new(AfmContactMode::new(hardware)),
            ProbeMode::AfmNonContact => Box::new(AfmNonContactMode::new(hardware)),
            ProbeMode::Profiling => Box::new(ProfilingMode::new(hardware)),
        }
    }
}
