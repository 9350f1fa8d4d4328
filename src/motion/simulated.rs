use log::{debug, info, warn};
use parking_lot::Mutex;
use std::time::Duration;

use super::MotionBackend;
use crate::error::SpmError;
use crate::types::{AxisTargets, BackendState, Position3D};

/// Upper bound on the emulated per-move latency
pub const MAX_STEP_DELAY: Duration = Duration::from_millis(100);

/// Default emulated stepper delay per move
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    position: Position3D,
    feed_rate: Option<f64>,
    moves: u64,
}

/// In-memory stepper emulation
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    step_delay: Duration,
}

impl SimulatedBackend {
    /// `step_delay` is clamped to [`MAX_STEP_DELAY`]
    pub fn new(step_delay: Duration) -> Self {
        if step_delay > MAX_STEP_DELAY {
            warn!(
                "Simulated step delay {:?} exceeds {:?}, clamping",
                step_delay, MAX_STEP_DELAY
            );
        }
        Self {
            state: Mutex::new(SimState::default()),
            step_delay: step_delay.min(MAX_STEP_DELAY),
        }
    }

    pub fn step_delay(&self) -> Duration {
        self.step_delay
    }

    /// Number of moves that actually changed the commanded position
    pub fn move_count(&self) -> u64 {
        self.state.lock().moves
    }

    pub fn position(&self) -> Position3D {
        self.state.lock().position
    }

    fn require_connected(&self) -> Result<(), SpmError> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(SpmError::NotConnected)
        }
    }

    fn emulate_latency(&self) {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_DELAY)
    }
}

impl MotionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connect(&self) -> Result<(), SpmError> {
        let mut state = self.state.lock();
        if !state.connected {
            state.connected = true;
            info!("Simulated motion backend connected");
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), SpmError> {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            info!("Simulated motion backend disconnected");
        }
        Ok(())
    }

    fn home(&self) -> Result<(), SpmError> {
        self.require_connected()?;
        self.emulate_latency();
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SpmError::HardwareFault(
                "backend disconnected during homing".to_string(),
            ));
        }
        state.position = Position3D::default();
        state.moves += 1;
        debug!("Simulated home complete");
        Ok(())
    }

    fn move_to(&self, targets: AxisTargets) -> Result<(), SpmError> {
        self.require_connected()?;
        if targets.is_empty() {
            return Ok(());
        }

        self.emulate_latency();

        let mut state = self.state.lock();
        // An emergency stop may have landed while the move was in flight
        if !state.connected {
            return Err(SpmError::HardwareFault(
                "backend disconnected during move".to_string(),
            ));
        }
        state.position.apply(&targets);
        if targets.feed_rate.is_some() {
            state.feed_rate = targets.feed_rate;
        }
        state.moves += 1;
        Ok(())
    }

    fn get_state(&self) -> BackendState {
        let state = self.state.lock();
        BackendState {
            connected: state.connected,
            position: state.position,
            feed_rate: state.feed_rate,
            port: None,
            baud_rate: None,
        }
    }

    fn emergency_stop(&self) -> Result<(), SpmError> {
        warn!("Emergency stop on simulated backend");
        self.disconnect()
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
