//! Scan lifecycle management
//!
//! [`ScanExecutor`] runs a [`ScanModeStrategy`] on a dedicated worker thread
//! and exposes start/pause/resume/stop to any number of controlling threads.
//!
//! Status transitions:
//!
//! ```text
//! Idle -> Running <-> Paused
//!            |          |
//!            v          v
//!  Completed | Aborted | Failed
//! ```
//!
//! A terminal status becomes visible only after the strategy has been
//! finalized and the backend lease released. An executor runs one scan.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use ndarray::Array2;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SpmError;
use crate::motion::BackendLease;
use crate::scan::{self, SampleBuffer, ScanModeStrategy};
use crate::types::{ExecutionStatus, ScanConfig, ScanSample, StepOutcome};
use crate::z_control::{GainLock, ZAxisController};

/// Longest a paused worker sleeps before re-checking its control flags
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Notifications published to [`ScanExecutor::subscribe`] receivers
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    StatusChanged(ExecutionStatus),
    Progress {
        completed: usize,
        total: usize,
        sample: ScanSample,
    },
}

#[derive(Debug, Default)]
struct Control {
    status: ExecutionStatus,
    stop_requested: bool,
}

#[derive(Default)]
struct Shared {
    control: Mutex<Control>,
    changed: Condvar,
    subscribers: Mutex<Vec<Sender<ScanEvent>>>,
}

impl Shared {
    /// Must be called with the control lock held so events keep status order
    fn publish(&self, event: ScanEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn set_status(&self, control: &mut Control, status: ExecutionStatus) {
        debug!("Scan status {} -> {}", control.status, status);
        control.status = status.clone();
        self.publish(ScanEvent::StatusChanged(status));
        self.changed.notify_all();
    }
}

/// Controller changes made before the scan starts, applied once the
/// strategy has initialized so they are not overwritten by the config
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PendingTuning {
    kp: Option<f64>,
    ki: Option<f64>,
    kd: Option<f64>,
    setpoint: Option<f64>,
}

impl PendingTuning {
    fn apply(&self, controller: &mut ZAxisController) -> Result<(), SpmError> {
        if self.kp.is_some() || self.ki.is_some() || self.kd.is_some() {
            controller.set_gains(self.kp, self.ki, self.kd)?;
        }
        if let Some(setpoint) = self.setpoint {
            controller.set_setpoint(setpoint)?;
        }
        Ok(())
    }
}

type StrategyCell = Arc<Mutex<Box<dyn ScanModeStrategy>>>;

pub struct ScanExecutor {
    config: ScanConfig,
    shared: Arc<Shared>,
    pending: Mutex<PendingTuning>,
    strategy: Mutex<Option<StrategyCell>>,
    samples: Mutex<Option<SampleBuffer>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanExecutor {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            pending: Mutex::new(PendingTuning::default()),
            strategy: Mutex::new(None),
            samples: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Launch the scan on a worker thread
    ///
    /// Valid only from `Idle`. The strategy's backend is claimed before this
    /// returns, so a second executor on the same backend fails with
    /// [`SpmError::BackendBusy`].
    pub fn start(&self, strategy: Box<dyn ScanModeStrategy>) -> Result<(), SpmError> {
        let mut control = self.shared.control.lock();
        match &control.status {
            ExecutionStatus::Idle => {}
            ExecutionStatus::Running | ExecutionStatus::Paused => {
                return Err(SpmError::AlreadyRunning);
            }
            terminal => return Err(SpmError::invalid_state("start", terminal)),
        }
        if strategy.mode() != self.config.mode() {
            return Err(SpmError::Configuration(format!(
                "{} strategy cannot run a {} scan",
                strategy.mode(),
                self.config.mode()
            )));
        }

        let lease = strategy.backend().claim()?;
        let samples = strategy.samples().clone();
        let gain_lock = strategy.controller().gain_lock();
        let cell: StrategyCell = Arc::new(Mutex::new(strategy));

        let worker = ScanWorker {
            shared: Arc::clone(&self.shared),
            strategy: Arc::clone(&cell),
            config: self.config.clone(),
            samples: samples.clone(),
            gain_lock,
            tuning: *self.pending.lock(),
        };
        let handle = thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || worker.run(lease))
            .map_err(|source| SpmError::Io {
                source,
                context: "spawning scan worker".to_string(),
            })?;

        *self.strategy.lock() = Some(cell);
        *self.samples.lock() = Some(samples);
        *self.worker.lock() = Some(handle);
        control.stop_requested = false;
        self.shared.set_status(&mut control, ExecutionStatus::Running);
        info!(
            "{} scan started ({} points)",
            self.config.mode(),
            self.config.expected_samples()
        );
        Ok(())
    }

    /// Suspend stepping after the current point. Valid only while `Running`.
    pub fn pause(&self) -> Result<(), SpmError> {
        let mut control = self.shared.control.lock();
        if control.stop_requested {
            return Err(SpmError::invalid_state("pause", "stopping"));
        }
        if control.status != ExecutionStatus::Running {
            return Err(SpmError::invalid_state("pause", &control.status));
        }
        self.shared.set_status(&mut control, ExecutionStatus::Paused);
        info!("Scan paused");
        Ok(())
    }

    /// Continue a paused scan. Valid only while `Paused`.
    pub fn resume(&self) -> Result<(), SpmError> {
        let mut control = self.shared.control.lock();
        if control.stop_requested {
            return Err(SpmError::invalid_state("resume", "stopping"));
        }
        if control.status != ExecutionStatus::Paused {
            return Err(SpmError::invalid_state("resume", &control.status));
        }
        self.shared.set_status(&mut control, ExecutionStatus::Running);
        info!("Scan resumed");
        Ok(())
    }

    /// Stop a running or paused scan and wait for the worker to finish
    ///
    /// On return the strategy has been finalized and the status is terminal.
    /// If the last point completed while the stop was in flight the scan ends
    /// `Completed` rather than `Aborted`.
    pub fn stop(&self) -> Result<(), SpmError> {
        {
            let mut control = self.shared.control.lock();
            if !control.status.is_active() {
                return Err(SpmError::invalid_state("stop", &control.status));
            }
            if control.stop_requested {
                return Err(SpmError::invalid_state("stop", "stopping"));
            }
            control.stop_requested = true;
            self.shared.changed.notify_all();
        }
        info!("Scan stop requested");
        self.join_worker();
        Ok(())
    }

    pub fn get_status(&self) -> ExecutionStatus {
        self.shared.control.lock().status.clone()
    }

    /// Copy of the samples recorded so far, in acquisition order
    pub fn get_data(&self) -> Vec<ScanSample> {
        self.samples
            .lock()
            .as_ref()
            .map(SampleBuffer::snapshot)
            .unwrap_or_default()
    }

    /// `(recorded, expected)` sample counts
    pub fn progress(&self) -> (usize, usize) {
        let recorded = self.samples.lock().as_ref().map_or(0, SampleBuffer::len);
        (recorded, self.config.expected_samples())
    }

    /// Recorded corrected Z values laid out as `[row, column]`
    pub fn height_map(&self) -> Array2<f64> {
        scan::height_map(&self.get_data(), &self.config)
    }

    /// Block until the scan reaches a terminal status or `timeout` elapses
    ///
    /// Returns the status at the time of return.
    pub fn wait(&self, timeout: Duration) -> ExecutionStatus {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.control.lock();
        while control.status.is_active() {
            if self
                .shared
                .changed
                .wait_until(&mut control, deadline)
                .timed_out()
            {
                break;
            }
        }
        let status = control.status.clone();
        drop(control);

        if status.is_terminal() {
            self.join_worker();
        }
        status
    }

    /// Change Z gains before the scan starts or while paused
    ///
    /// Values given while `Idle` are held and applied to the controller once
    /// the scan has initialized.
    pub fn set_gains(
        &self,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
    ) -> Result<(), SpmError> {
        let control = self.shared.control.lock();
        if control.status == ExecutionStatus::Idle {
            let mut pending = self.pending.lock();
            pending.kp = kp.or(pending.kp);
            pending.ki = ki.or(pending.ki);
            pending.kd = kd.or(pending.kd);
            return Ok(());
        }
        self.with_idle_controller(control, "set gains", |controller| {
            controller.set_gains(kp, ki, kd)
        })
    }

    /// Change the Z setpoint before the scan starts or while paused
    pub fn set_setpoint(&self, setpoint: f64) -> Result<(), SpmError> {
        if !setpoint.is_finite() {
            return Err(SpmError::Configuration(format!(
                "setpoint must be finite, got {setpoint}"
            )));
        }
        let control = self.shared.control.lock();
        if control.status == ExecutionStatus::Idle {
            self.pending.lock().setpoint = Some(setpoint);
            return Ok(());
        }
        self.with_idle_controller(control, "set setpoint", |controller| {
            controller.set_setpoint(setpoint)
        })
    }

    /// Receiver for status changes and per-point progress
    pub fn subscribe(&self) -> Receiver<ScanEvent> {
        let (sender, receiver) = unbounded();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    fn with_idle_controller<F>(
        &self,
        control: MutexGuard<'_, Control>,
        operation: &str,
        apply: F,
    ) -> Result<(), SpmError>
    where
        F: FnOnce(&mut ZAxisController) -> Result<(), SpmError>,
    {
        if control.status == ExecutionStatus::Running {
            return Err(SpmError::invalid_state(operation, &control.status));
        }
        let cell = self
            .strategy
            .lock()
            .clone()
            .ok_or_else(|| SpmError::invalid_state(operation, "no strategy loaded"))?;
        // Held across the update so a resume cannot slip in before it lands
        let mut strategy = cell.lock();
        let result = apply(strategy.controller_mut());
        drop(control);
        result
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Scan worker panicked");
            }
        }
    }
}

impl Drop for ScanExecutor {
    fn drop(&mut self) {
        if self.get_status().is_active() {
            warn!("Scan executor dropped while active, stopping scan");
            if let Err(e) = self.stop() {
                debug!("Stop on drop: {e}");
            }
        }
        self.join_worker();
    }
}

enum Finish {
    Completed,
    Aborted,
}

/// State moved onto the worker thread
struct ScanWorker {
    shared: Arc<Shared>,
    strategy: StrategyCell,
    config: ScanConfig,
    samples: SampleBuffer,
    gain_lock: GainLock,
    tuning: PendingTuning,
}

impl ScanWorker {
    fn run(self, lease: BackendLease) {
        // A panicking strategy still ends the scan; parking_lot locks do not
        // poison, so the strategy and buffer stay usable afterwards.
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(payload) => Err(format!(
                "scan strategy panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        let finalize = AssertUnwindSafe(|| self.strategy.lock().finalize());
        let finalized = match panic::catch_unwind(finalize) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        self.gain_lock.release();
        self.samples.freeze();
        drop(lease);

        let status = match (outcome, finalized) {
            (Ok(Finish::Completed), Ok(())) => ExecutionStatus::Completed,
            (Ok(Finish::Aborted), Ok(())) => ExecutionStatus::Aborted,
            (Ok(_), Err(e)) => ExecutionStatus::Failed(format!("finalize failed: {e}")),
            (Err(e), Ok(())) => ExecutionStatus::Failed(e),
            (Err(e), Err(f)) => ExecutionStatus::Failed(format!("{e}; finalize failed: {f}")),
        };

        match &status {
            ExecutionStatus::Failed(reason) => error!("Scan failed: {reason}"),
            other => info!(
                "Scan {other} with {}/{} samples",
                self.samples.len(),
                self.config.expected_samples()
            ),
        }

        let mut control = self.shared.control.lock();
        self.shared.set_status(&mut control, status);
    }

    fn drive(&self) -> Result<Finish, SpmError> {
        {
            let mut strategy = self.strategy.lock();
            strategy.initialize(&self.config)?;
            if self.tuning != PendingTuning::default() {
                self.tuning.apply(strategy.controller_mut())?;
                debug!("Applied pre-start controller tuning {:?}", self.tuning);
            }
        }
        let total = self.config.expected_samples();

        loop {
            if !self.wait_while_paused() {
                return Ok(Finish::Aborted);
            }

            let outcome = {
                let mut strategy = self.strategy.lock();
                let _gains = self.gain_lock.hold();
                strategy.step()?
            };

            match outcome {
                StepOutcome::Done => return Ok(Finish::Completed),
                StepOutcome::Running => {
                    if let Some(sample) = self.samples.last() {
                        let control = self.shared.control.lock();
                        self.shared.publish(ScanEvent::Progress {
                            completed: self.samples.len(),
                            total,
                            sample,
                        });
                        drop(control);
                    }
                }
            }
        }
    }

    /// Returns `false` when a stop was requested
    fn wait_while_paused(&self) -> bool {
        let mut control = self.shared.control.lock();
        loop {
            if control.stop_requested {
                return false;
            }
            if control.status != ExecutionStatus::Paused {
                return true;
            }
            self.shared.changed.wait_for(&mut control, PAUSE_POLL);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{
        BackendHandle, SerialBackend, SerialSettings, SharedBackend, SimulatedBackend,
    };
    use crate::scan::{HardwareFactory, StmMode};
    use crate::surface::{SurfaceModel, Topography};
    use crate::types::{Position, ProbeMode};
    use crate::z_control::PidGains;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(10);

    fn factory(step_delay: Duration) -> HardwareFactory {
        let backend = BackendHandle::new(SimulatedBackend::new(step_delay));
        let surface = SurfaceModel::new(Topography::Sinusoidal, 10.0, 10.0).with_seed(5);
        HardwareFactory::simulated(backend, surface)
    }

    fn stm_config(resolution: usize) -> ScanConfig {
        ScanConfig::builder(ProbeMode::Stm)
            .scan_size(10.0)
            .resolution(resolution)
            .build()
            .unwrap()
    }

    /// Long enough that control calls land mid-scan
    fn slow_scan() -> (HardwareFactory, ScanConfig) {
        (factory(Duration::from_millis(5)), stm_config(30))
    }

    struct CountingStrategy {
        inner: StmMode,
        finalized: Arc<AtomicUsize>,
        steps: usize,
        panic_on_step: Option<usize>,
        /// Controller setpoint and gains seen by the first step
        first_step: Arc<Mutex<Option<(f64, PidGains)>>>,
    }

    impl CountingStrategy {
        fn new(factory: &HardwareFactory) -> Self {
            Self {
                inner: StmMode::new(factory.assemble(ProbeMode::Stm)),
                finalized: Arc::new(AtomicUsize::new(0)),
                steps: 0,
                panic_on_step: None,
                first_step: Arc::new(Mutex::new(None)),
            }
        }

        fn panicking_on(mut self, step: usize) -> Self {
            self.panic_on_step = Some(step);
            self
        }
    }

    impl ScanModeStrategy for CountingStrategy {
        fn mode(&self) -> ProbeMode {
            self.inner.mode()
        }
        fn initialize(&mut self, config: &ScanConfig) -> Result<(), SpmError> {
            self.inner.initialize(config)
        }
        fn step(&mut self) -> Result<StepOutcome, SpmError> {
            self.steps += 1;
            if self.panic_on_step == Some(self.steps) {
                panic!("servo table overrun at step {}", self.steps);
            }
            let controller = self.inner.controller();
            self.first_step
                .lock()
                .get_or_insert((controller.setpoint(), controller.gains()));
            self.inner.step()
        }
        fn finalize(&mut self) -> Result<(), SpmError> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            self.inner.finalize()
        }
        fn backend(&self) -> &SharedBackend {
            self.inner.backend()
        }
        fn controller(&self) -> &ZAxisController {
            self.inner.controller()
        }
        fn controller_mut(&mut self) -> &mut ZAxisController {
            self.inner.controller_mut()
        }
        fn samples(&self) -> &SampleBuffer {
            self.inner.samples()
        }
    }

    fn wait_for_samples(executor: &ScanExecutor, count: usize) {
        let deadline = Instant::now() + WAIT;
        while executor.progress().0 < count {
            assert!(Instant::now() < deadline, "scan made no progress");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_stm_scan_completes() {
        let factory = factory(Duration::ZERO);
        let config = stm_config(5);
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        assert_eq!(executor.wait(WAIT), ExecutionStatus::Completed);

        let data = executor.get_data();
        assert_eq!(data.len(), 25);
        assert_eq!(data[0].position(), Position::new(0.0, 0.0));
        assert_eq!(data[24].position(), Position::new(10.0, 10.0));
        assert_eq!(executor.progress(), (25, 25));

        // Strategy connected the backend itself, so finalize released it
        assert!(!factory.backend().is_connected());
        assert!(!factory.backend().is_claimed());
    }

    #[test]
    fn test_pause_on_idle_is_invalid() {
        let executor = ScanExecutor::new(stm_config(3));
        assert!(matches!(
            executor.pause(),
            Err(SpmError::InvalidState { .. })
        ));
        assert!(matches!(
            executor.resume(),
            Err(SpmError::InvalidState { .. })
        ));
        assert!(matches!(executor.stop(), Err(SpmError::InvalidState { .. })));
        assert_eq!(executor.get_status(), ExecutionStatus::Idle);
        assert!(executor.get_data().is_empty());
    }

    #[test]
    fn test_pause_then_stop_finalizes_once() {
        let (factory, config) = slow_scan();
        let strategy = CountingStrategy::new(&factory);
        let finalized = Arc::clone(&strategy.finalized);
        let executor = ScanExecutor::new(config.clone());

        executor.start(Box::new(strategy)).unwrap();
        wait_for_samples(&executor, 2);
        executor.pause().unwrap();
        assert_eq!(executor.get_status(), ExecutionStatus::Paused);

        // A second pause is not a no-op
        assert!(executor.pause().is_err());

        executor.stop().unwrap();
        assert_eq!(executor.get_status(), ExecutionStatus::Aborted);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(executor.get_data().len() < config.expected_samples());

        assert!(matches!(executor.stop(), Err(SpmError::InvalidState { .. })));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_paused_scan_records_nothing() {
        let (factory, config) = slow_scan();
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        wait_for_samples(&executor, 1);
        executor.pause().unwrap();

        // Let an in-flight step land, then the count must hold still
        thread::sleep(Duration::from_millis(50));
        let paused_at = executor.progress().0;
        thread::sleep(Duration::from_millis(150));
        assert_eq!(executor.progress().0, paused_at);

        executor.resume().unwrap();
        wait_for_samples(&executor, paused_at + 1);
        executor.stop().unwrap();
    }

    #[test]
    fn test_second_start_is_already_running() {
        let (slow, config) = slow_scan();
        let other = factory(Duration::ZERO);
        let executor = ScanExecutor::new(config.clone());

        executor.start(slow.build_strategy(&config)).unwrap();
        assert!(matches!(
            executor.start(other.build_strategy(&config)),
            Err(SpmError::AlreadyRunning)
        ));
        executor.stop().unwrap();

        // Single use: a finished executor does not restart
        assert!(matches!(
            executor.start(other.build_strategy(&config)),
            Err(SpmError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_shared_backend_is_busy() {
        let (factory, config) = slow_scan();
        let first = ScanExecutor::new(config.clone());
        let second = ScanExecutor::new(config.clone());

        first.start(factory.build_strategy(&config)).unwrap();
        assert!(matches!(
            second.start(factory.build_strategy(&config)),
            Err(SpmError::BackendBusy)
        ));
        assert_eq!(second.get_status(), ExecutionStatus::Idle);

        first.stop().unwrap();
        second.start(factory.build_strategy(&config)).unwrap();
        second.stop().unwrap();
    }

    #[test]
    fn test_emergency_stop_fails_scan() {
        let (factory, config) = slow_scan();
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        wait_for_samples(&executor, 3);
        factory.backend().emergency_stop().unwrap();

        let status = executor.wait(WAIT);
        assert!(matches!(status, ExecutionStatus::Failed(_)), "{status}");
        assert!(!status.reason().unwrap_or_default().is_empty());
        assert!(!factory.backend().is_claimed());
    }

    #[test]
    fn test_initialize_failure_fails_scan() {
        let backend = BackendHandle::new(SerialBackend::new(SerialSettings::default()));
        let factory = HardwareFactory::hardware(backend);
        let config = stm_config(2);
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        let status = executor.wait(WAIT);

        assert!(matches!(status, ExecutionStatus::Failed(_)));
        assert!(executor.get_data().is_empty());
    }

    #[test]
    fn test_gains_locked_while_running() {
        let (factory, config) = slow_scan();
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        assert!(matches!(
            executor.set_gains(Some(9.0), None, None),
            Err(SpmError::InvalidState { .. })
        ));
        assert!(matches!(
            executor.set_setpoint(2.0),
            Err(SpmError::InvalidState { .. })
        ));

        executor.pause().unwrap();
        executor.set_gains(Some(9.0), None, None).unwrap();
        executor.set_setpoint(2.0).unwrap();
        executor.stop().unwrap();
    }

    #[test]
    fn test_panicking_step_fails_scan() {
        let (factory, config) = slow_scan();
        let strategy = CountingStrategy::new(&factory).panicking_on(3);
        let finalized = Arc::clone(&strategy.finalized);
        let gain_lock = strategy.controller().gain_lock();
        let executor = ScanExecutor::new(config.clone());
        let events = executor.subscribe();

        executor.start(Box::new(strategy)).unwrap();
        let status = executor.wait(WAIT);

        match &status {
            ExecutionStatus::Failed(reason) => assert!(reason.contains("servo table overrun")),
            other => panic!("expected Failed, got {other}"),
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(executor.get_data().len(), 2);
        assert!(!factory.backend().is_connected());
        assert!(!factory.backend().is_claimed());
        assert!(!gain_lock.is_engaged());

        // Terminal status reached subscribers, so event loops end
        let last = events.try_iter().last();
        assert_eq!(last, Some(ScanEvent::StatusChanged(status)));
        assert!(matches!(executor.stop(), Err(SpmError::InvalidState { .. })));
    }

    #[test]
    fn test_tuning_before_start_survives_initialize() {
        let factory = factory(Duration::ZERO);
        let config = stm_config(3);
        let strategy = CountingStrategy::new(&factory);
        let first_step = Arc::clone(&strategy.first_step);
        let executor = ScanExecutor::new(config.clone());

        executor.set_setpoint(2.5).unwrap();
        executor.set_gains(Some(0.4), None, None).unwrap();
        executor.set_gains(None, None, Some(0.02)).unwrap();
        executor.start(Box::new(strategy)).unwrap();
        assert_eq!(executor.wait(WAIT), ExecutionStatus::Completed);

        let (setpoint, gains) = (*first_step.lock()).expect("scan took no step");
        assert_eq!(setpoint, 2.5);
        assert_ne!(setpoint, config.setpoint());
        assert_eq!(gains.kp, 0.4);
        assert_eq!(gains.kd, 0.02);
    }

    #[test]
    fn test_stop_from_pause_is_prompt() {
        let (factory, config) = slow_scan();
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        wait_for_samples(&executor, 1);
        executor.pause().unwrap();
        // Worker is parked in its pause wait by now
        thread::sleep(Duration::from_millis(150));

        let requested = Instant::now();
        executor.stop().unwrap();
        assert!(requested.elapsed() <= PAUSE_POLL, "{:?}", requested.elapsed());
        assert_eq!(executor.get_status(), ExecutionStatus::Aborted);
    }

    #[test]
    fn test_get_data_is_a_snapshot() {
        let (factory, config) = slow_scan();
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        wait_for_samples(&executor, 2);
        let mut snapshot = executor.get_data();
        let taken = snapshot.len();
        snapshot.clear();

        executor.stop().unwrap();
        assert!(executor.get_data().len() >= taken);
    }

    #[test]
    fn test_subscribers_see_status_and_progress() {
        let factory = factory(Duration::ZERO);
        let config = stm_config(3);
        let executor = ScanExecutor::new(config.clone());
        let events = executor.subscribe();

        executor.start(factory.build_strategy(&config)).unwrap();
        executor.wait(WAIT);

        let events: Vec<ScanEvent> = events.try_iter().collect();
        assert_eq!(
            events.first(),
            Some(&ScanEvent::StatusChanged(ExecutionStatus::Running))
        );
        assert_eq!(
            events.last(),
            Some(&ScanEvent::StatusChanged(ExecutionStatus::Completed))
        );
        let progress: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                ScanEvent::Progress { completed, .. } => Some(*completed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_height_map_after_completion() {
        let factory = factory(Duration::ZERO);
        let config = stm_config(4);
        let executor = ScanExecutor::new(config.clone());

        executor.start(factory.build_strategy(&config)).unwrap();
        executor.wait(WAIT);

        let map = executor.height_map();
        assert_eq!(map.dim(), (4, 4));
        assert!(map.iter().all(|z| z.is_finite()));
    }
}
