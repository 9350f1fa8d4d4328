//! Z-axis feedback regulation
//!
//! [`ZAxisController`] is a discrete PID regulator. Each call to
//! [`ZAxisController::update`] consumes one measured signal value and returns
//! the corrected Z command.
//!
//! The integral accumulator is unbounded unless an explicit clamp is
//! configured with [`ZAxisController::with_integral_limit`].

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SpmError;
use crate::types::RegulationMode;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.2,
            ki: 0.05,
            kd: 0.01,
        }
    }
}

/// PID accumulator owned by one controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerState {
    pub setpoint: f64,
    pub gains: PidGains,
    pub integral_accumulator: f64,
    pub last_error: f64,
    pub current_output: f64,
}

/// Shared flag that forbids gain and setpoint changes while a scan runs
#[derive(Debug, Clone, Default)]
pub struct GainLock(Arc<AtomicBool>);

impl GainLock {
    pub fn engage(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Engage until the returned guard is dropped, unwinding included
    pub fn hold(&self) -> GainLockGuard<'_> {
        self.engage();
        GainLockGuard(self)
    }
}

pub struct GainLockGuard<'a>(&'a GainLock);

impl Drop for GainLockGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[derive(Debug, Clone)]
pub struct ZAxisController {
    state: ControllerState,
    regulation: RegulationMode,
    position: f64,
    integral_limit: Option<f64>,
    gain_lock: GainLock,
}

impl ZAxisController {
    /// Regulation mode is fixed for the controller's lifetime
    pub fn new(gains: PidGains, setpoint: f64, regulation: RegulationMode) -> Self {
        Self {
            state: ControllerState {
                setpoint,
                gains,
                integral_accumulator: 0.0,
                last_error: 0.0,
                current_output: 0.0,
            },
            regulation,
            position: 0.0,
            integral_limit: None,
            gain_lock: GainLock::default(),
        }
    }

    /// Clamp the integral accumulator to `[-limit, limit]`
    pub fn with_integral_limit(mut self, limit: f64) -> Self {
        self.integral_limit = Some(limit.abs());
        self
    }

    /// Run one regulation cycle and return the corrected Z position
    pub fn update(&mut self, measured_value: f64) -> f64 {
        let state = &mut self.state;
        let error = state.setpoint - measured_value;

        state.integral_accumulator += error;
        if let Some(limit) = self.integral_limit {
            state.integral_accumulator = state.integral_accumulator.clamp(-limit, limit);
        }
        let derivative = error - state.last_error;

        let output = state.gains.kp * error
            + state.gains.ki * state.integral_accumulator
            + state.gains.kd * derivative;

        state.last_error = error;
        state.current_output = output;

        self.position = match self.regulation {
            RegulationMode::ConstantCurrent => self.position + output,
            RegulationMode::ConstantHeight => output,
        };

        trace!(
            "Z update: measured={measured_value:.4} error={error:.4} output={output:.4} z={:.4}",
            self.position
        );
        self.position
    }

    /// Zero the integral and derivative history; gains and setpoint stay
    pub fn reset(&mut self) {
        self.state.integral_accumulator = 0.0;
        self.state.last_error = 0.0;
        self.state.current_output = 0.0;
    }

    /// Change any subset of the gains
    ///
    /// Fails with [`SpmError::InvalidState`] while the owning scan is running.
    pub fn set_gains(
        &mut self,
        kp: Option<f64>,
        ki: Option<f64>,
        kd: Option<f64>,
    ) -> Result<(), SpmError> {
        self.ensure_unlocked("set gains")?;
        let gains = &mut self.state.gains;
        if let Some(kp) = kp {
            gains.kp = kp;
        }
        if let Some(ki) = ki {
            gains.ki = ki;
        }
        if let Some(kd) = kd {
            gains.kd = kd;
        }
        debug!("Z gains set to {:?}", self.state.gains);
        Ok(())
    }

    pub fn set_setpoint(&mut self, setpoint: f64) -> Result<(), SpmError> {
        self.ensure_unlocked("set setpoint")?;
        self.state.setpoint = setpoint;
        debug!("Z setpoint set to {setpoint}");
        Ok(())
    }

    /// Re-seat the Z reference, e.g. at the start of a scan
    pub fn set_position(&mut self, z: f64) {
        self.position = z;
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn gains(&self) -> PidGains {
        self.state.gains
    }

    pub fn setpoint(&self) -> f64 {
        self.state.setpoint
    }

    pub fn regulation(&self) -> RegulationMode {
        self.regulation
    }

    pub fn integral_limit(&self) -> Option<f64> {
        self.integral_limit
    }

    pub fn gain_lock(&self) -> GainLock {
        self.gain_lock.clone()
    }

    fn ensure_unlocked(&self, operation: &str) -> Result<(), SpmError> {
        if self.gain_lock.is_engaged() {
            Err(SpmError::invalid_state(operation, "running"))
        } else {
            Ok(())
        }
    }
}
