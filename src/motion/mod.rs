//! Motion backends
//!
//! A [`MotionBackend`] drives the X/Y/Z axes of the instrument. Backends use
//! interior mutability so that [`MotionBackend::emergency_stop`] can be issued
//! from any thread while the scan worker is in the middle of a move.
//!
//! Backends are shared through [`BackendHandle`], which also enforces that at
//! most one running scan owns a backend at a time.

pub mod protocol;
pub mod serial;
pub mod simulated;

pub use serial::{NativeSerialPort, PortOpener, SerialBackend, SerialSettings, SerialTransport};
pub use simulated::SimulatedBackend;

use crate::error::SpmError;
use crate::types::{AxisTargets, BackendState};
use log::debug;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Uniform interface over a motion-producing device
pub trait MotionBackend: Send + Sync {
    /// Short human-readable name for log lines
    fn name(&self) -> &str;

    /// Open the transport and select absolute positioning. Never moves an axis.
    fn connect(&self) -> Result<(), SpmError>;

    fn disconnect(&self) -> Result<(), SpmError>;

    /// Home all axes (blocking)
    fn home(&self) -> Result<(), SpmError>;

    /// Absolute move of the axes present in `targets`; omitted axes stay put
    fn move_to(&self, targets: AxisTargets) -> Result<(), SpmError>;

    fn get_state(&self) -> BackendState;

    /// Send an immediate-stop directive (best effort) and force disconnection
    fn emergency_stop(&self) -> Result<(), SpmError>;

    /// Read the live probe signal at the current position
    fn read_signal(&self) -> Result<f64, SpmError> {
        Err(SpmError::HardwareFault(format!(
            "{} has no probe signal channel",
            self.name()
        )))
    }

    fn is_connected(&self) -> bool {
        self.get_state().connected
    }
}

/// Shared owner of a motion backend
///
/// Dereferences to the backend itself. Scans claim the handle through
/// [`BackendHandle::claim`] for as long as they run.
pub struct BackendHandle {
    backend: Box<dyn MotionBackend>,
    claimed: AtomicBool,
}

pub type SharedBackend = Arc<BackendHandle>;

impl BackendHandle {
    pub fn new<B: MotionBackend + 'static>(backend: B) -> SharedBackend {
        Arc::new(Self {
            backend: Box::new(backend),
            claimed: AtomicBool::new(false),
        })
    }

    /// Take exclusive scan ownership of the backend
    ///
    /// Fails with [`SpmError::BackendBusy`] while another lease is alive.
    pub fn claim(self: &Arc<Self>) -> Result<BackendLease, SpmError> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SpmError::BackendBusy)?;
        debug!("Backend {} claimed", self.backend.name());
        Ok(BackendLease {
            handle: Arc::clone(self),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl Deref for BackendHandle {
    type Target = dyn MotionBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

/// Scan ownership of a backend; released on drop
pub struct BackendLease {
    handle: SharedBackend,
}

impl BackendLease {
    pub fn backend(&self) -> &SharedBackend {
        &self.handle
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.handle.claimed.store(false, Ordering::Release);
        debug!("Backend {} released", self.handle.name());
    }
}
