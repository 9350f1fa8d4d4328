//! The four probe-mode strategies
//!
//! All modes share the same per-point sequence: move laterally, read the
//! probe signal, run the Z controller, move Z, record the sample. They differ
//! in the signal they regulate on and in the raster they walk.

use log::{debug, info, warn};

use crate::error::SpmError;
use crate::motion::SharedBackend;
use crate::scan::hardware::{ScanHardware, SignalSource};
use crate::scan::raster::RasterCursor;
use crate::scan::{SampleBuffer, ScanModeStrategy};
use crate::types::{AxisTargets, ProbeMode, ScanConfig, ScanSample, StepOutcome};
use crate::z_control::ZAxisController;

/// State and step logic common to every mode
struct ScanCore {
    mode: ProbeMode,
    backend: SharedBackend,
    signal: SignalSource,
    controller: ZAxisController,
    samples: SampleBuffer,
    cursor: Option<RasterCursor>,
    feed_rate: Option<f64>,
    connected_by_scan: bool,
}

impl ScanCore {
    fn new(mode: ProbeMode, hardware: ScanHardware) -> Self {
        Self {
            mode,
            backend: hardware.backend,
            signal: hardware.signal,
            controller: hardware.controller,
            samples: SampleBuffer::new(),
            cursor: None,
            feed_rate: None,
            connected_by_scan: false,
        }
    }

    fn initialize(&mut self, config: &ScanConfig) -> Result<(), SpmError> {
        if config.mode() != self.mode {
            return Err(SpmError::Configuration(format!(
                "{} strategy cannot run a {} scan",
                self.mode,
                config.mode()
            )));
        }

        if !self.backend.is_connected() {
            self.backend.connect()?;
            self.connected_by_scan = true;
        }

        self.controller.reset();
        self.controller.set_setpoint(config.setpoint())?;
        self.controller.set_position(self.backend.get_state().position.z);

        self.samples.reset(config.expected_samples());
        self.cursor = Some(RasterCursor::for_config(config));
        self.feed_rate = config.feed_rate();

        info!(
            "{} scan initialized: {} points, range {}x{}, setpoint {}",
            self.mode,
            config.expected_samples(),
            config.x_range(),
            config.y_range(),
            config.setpoint()
        );
        Ok(())
    }

    fn step(&mut self) -> Result<StepOutcome, SpmError> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(SpmError::invalid_state("step", "uninitialized"));
        };
        let Some(position) = cursor.current() else {
            return Ok(StepOutcome::Done);
        };

        if !self.backend.is_connected() {
            return Err(SpmError::HardwareFault(format!(
                "{} disconnected during scan",
                self.backend.name()
            )));
        }

        let lateral = AxisTargets::xy(position).with_feed_rate(self.feed_rate);
        self.backend.move_to(lateral).map_err(mid_scan)?;

        let measured = match &self.signal {
            SignalSource::Surface(model) => {
                model.height_or_signal(position.x, position.y, self.mode)
            }
            SignalSource::Backend => self.backend.read_signal().map_err(mid_scan)?,
        };

        let z = self.controller.update(measured);
        self.backend.move_to(AxisTargets::z(z)).map_err(mid_scan)?;

        self.samples.push(ScanSample::new(position, z, measured))?;
        cursor.advance();
        Ok(StepOutcome::Running)
    }

    fn finalize(&mut self) -> Result<(), SpmError> {
        if self.cursor.take().is_none() {
            return Ok(());
        }

        self.controller.reset();
        if std::mem::take(&mut self.connected_by_scan) && self.backend.is_connected() {
            self.backend.disconnect()?;
        }
        debug!("{} scan finalized with {} samples", self.mode, self.samples.len());
        Ok(())
    }
}

/// A backend that dropped its connection mid-step is a hardware fault
fn mid_scan(error: SpmError) -> SpmError {
    match error {
        SpmError::NotConnected => {
            warn!("Motion backend lost during scan step");
            SpmError::HardwareFault("motion backend disconnected".to_string())
        }
        other => other,
    }
}

macro_rules! probe_mode_strategy {
    ($(#[$meta:meta])* $name:ident, $mode:expr) => {
        $(#[$meta])*
        pub struct $name {
            core: ScanCore,
        }

        impl $name {
            pub fn new(hardware: ScanHardware) -> Self {
                Self {
                    core: ScanCore::new($mode, hardware),
                }
            }
        }

        impl ScanModeStrategy for $name {
            fn mode(&self) -> ProbeMode {
                self.core.mode
            }

            fn initialize(&mut self, config: &ScanConfig) -> Result<(), SpmError> {
                self.core.initialize(config)
            }

            fn step(&mut self) -> Result<StepOutcome, SpmError> {
                self.core.step()
            }

            fn finalize(&mut self) -> Result<(), SpmError> {
                self.core.finalize()
            }

            fn backend(&self) -> &SharedBackend {
                &self.core.backend
            }

            fn controller(&self) -> &ZAxisController {
                &self.core.controller
            }

            fn controller_mut(&mut self) -> &mut ZAxisController {
                &mut self.core.controller
            }

            fn samples(&self) -> &SampleBuffer {
                &self.core.samples
            }
        }
    };
}

probe_mode_strategy!(
    /// Scanning tunneling microscopy, regulating on tunneling current
    StmMode,
    ProbeMode::Stm
);

probe_mode_strategy!(
    /// Contact AFM, regulating on cantilever deflection
    AfmContactMode,
    ProbeMode::AfmContact
);

probe_mode_strategy!(
    /// Non-contact AFM, regulating on oscillation amplitude
    AfmNonContactMode,
    ProbeMode::AfmNonContact
);

probe_mode_strategy!(
    /// Single-line surface profile along the configured axis
    ProfilingMode,
    ProbeMode::Profiling
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{BackendHandle, SimulatedBackend};
    use crate::scan::HardwareFactory;
    use crate::surface::{SurfaceModel, Topography};
    use crate::types::{Position, ScanAxis};
    use std::time::Duration;

    fn simulated_factory() -> HardwareFactory {
        let backend = BackendHandle::new(SimulatedBackend::new(Duration::ZERO));
        let surface = SurfaceModel::new(Topography::Sinusoidal, 10.0, 10.0).with_seed(11);
        HardwareFactory::simulated(backend, surface)
    }

    fn run_to_done(strategy: &mut dyn ScanModeStrategy) -> usize {
        let mut steps = 0;
        while strategy.step().unwrap() == StepOutcome::Running {
            steps += 1;
        }
        steps
    }

    #[test]
    fn test_stm_area_scan_visits_full_grid() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::Stm)
            .scan_size(10.0)
            .resolution(5)
            .build()
            .unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        stm.initialize(&config).unwrap();
        assert_eq!(run_to_done(&mut stm), 25);

        let samples = stm.samples().snapshot();
        assert_eq!(samples.len(), 25);
        assert_eq!(samples[0].position(), Position::new(0.0, 0.0));
        assert_eq!(samples[24].position(), Position::new(10.0, 10.0));
        for sample in &samples {
            assert!((0.0..=10.0).contains(&sample.x));
            assert!((0.0..=10.0).contains(&sample.y));
        }

        // Further steps stay done and add nothing
        assert_eq!(stm.step().unwrap(), StepOutcome::Done);
        assert_eq!(stm.samples().len(), 25);
    }

    #[test]
    fn test_profiling_sweeps_one_line() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::Profiling)
            .x_range(6.0)
            .resolution(7)
            .profile_axis(ScanAxis::X)
            .build()
            .unwrap();
        let mut profile = ProfilingMode::new(factory.assemble(ProbeMode::Profiling));

        profile.initialize(&config).unwrap();
        assert_eq!(run_to_done(&mut profile), 7);

        let samples = profile.samples().snapshot();
        assert!(samples.iter().all(|s| s.y == 0.0));
        assert_eq!(samples[6].x, 6.0);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::AfmContact)
            .resolution(3)
            .setpoint(0.4)
            .build()
            .unwrap();
        let mut afm = AfmContactMode::new(factory.assemble(ProbeMode::AfmContact));

        afm.initialize(&config).unwrap();
        let first = afm.controller().state().clone();
        afm.initialize(&config).unwrap();

        assert_eq!(afm.controller().state(), &first);
        assert_eq!(afm.controller().setpoint(), 0.4);
        assert!(afm.samples().is_empty());
        assert_eq!(run_to_done(&mut afm), 9);

        // Only the first initialize connected, so finalize still releases it
        afm.finalize().unwrap();
        assert!(!factory.backend().is_connected());
    }

    #[test]
    fn test_reinitialize_after_steps_clears_samples() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::AfmNonContact)
            .resolution(2)
            .build()
            .unwrap();
        let mut afm = AfmNonContactMode::new(factory.assemble(ProbeMode::AfmNonContact));

        afm.initialize(&config).unwrap();
        afm.step().unwrap();
        afm.initialize(&config).unwrap();

        assert!(afm.samples().is_empty());
        assert_eq!(run_to_done(&mut afm), 4);
    }

    #[test]
    fn test_finalize_without_initialize_is_noop() {
        let factory = simulated_factory();
        factory.backend().connect().unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        stm.finalize().unwrap();
        assert!(factory.backend().is_connected());
    }

    #[test]
    fn test_finalize_leaves_foreign_connection_open() {
        let factory = simulated_factory();
        factory.backend().connect().unwrap();
        let config = ScanConfig::builder(ProbeMode::Stm).resolution(2).build().unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        stm.initialize(&config).unwrap();
        run_to_done(&mut stm);
        stm.finalize().unwrap();

        assert!(factory.backend().is_connected());
    }

    #[test]
    fn test_step_before_initialize_is_invalid() {
        let factory = simulated_factory();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));
        assert!(matches!(stm.step(), Err(SpmError::InvalidState { .. })));
    }

    #[test]
    fn test_step_after_disconnect_is_hardware_fault() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::Stm).resolution(3).build().unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        stm.initialize(&config).unwrap();
        stm.step().unwrap();
        factory.backend().emergency_stop().unwrap();

        assert!(matches!(stm.step(), Err(SpmError::HardwareFault(_))));
        assert_eq!(stm.samples().len(), 1);
    }

    #[test]
    fn test_mode_mismatch_is_rejected() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::Profiling).build().unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        assert!(matches!(
            stm.initialize(&config),
            Err(SpmError::Configuration(_))
        ));
        assert!(!factory.backend().is_connected());
    }

    #[test]
    fn test_live_signal_without_channel_fails_step() {
        let backend = BackendHandle::new(SimulatedBackend::new(Duration::ZERO));
        let factory = HardwareFactory::hardware(backend);
        let config = ScanConfig::builder(ProbeMode::Stm).resolution(2).build().unwrap();
        let mut stm = StmMode::new(factory.assemble(ProbeMode::Stm));

        stm.initialize(&config).unwrap();
        assert!(matches!(stm.step(), Err(SpmError::HardwareFault(_))));
    }

    #[test]
    fn test_samples_follow_controller_output() {
        let factory = simulated_factory();
        let config = ScanConfig::builder(ProbeMode::AfmContact)
            .resolution(2)
            .build()
            .unwrap();
        let mut afm = AfmContactMode::new(factory.assemble(ProbeMode::AfmContact));

        afm.initialize(&config).unwrap();
        afm.step().unwrap();

        let sample = afm.samples().last().unwrap();
        assert_eq!(sample.z_corrected, afm.controller().position());
        assert_eq!(
            factory.backend().get_state().position.z,
            sample.z_corrected
        );
    }
}
