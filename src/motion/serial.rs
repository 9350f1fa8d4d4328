//! Serial-attached motion controller
//!
//! Commands go through a [`SerialTransport`]; the production transport wraps
//! the `serialport` crate. A second handle to the same port is cloned on
//! connect and reserved for the emergency-stop directive, so a stop can be
//! pushed onto the wire while a long move still holds the command channel.

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::MotionBackend;
use super::protocol;
use crate::error::SpmError;
use crate::types::{AxisTargets, BackendState, Position3D};
use crate::utils::{PollError, poll_with_timeout};

/// Line-level access to a serial device
pub trait SerialTransport: Send {
    /// Write one command line; the terminator is appended by the transport
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read one line without its terminator. `Ok(None)` on read timeout.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Drop anything buffered by the device before the first command
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Second handle onto the same device
    fn try_clone(&self) -> io::Result<Box<dyn SerialTransport>>;
}

/// Opens a transport for the given settings
pub type PortOpener =
    Arc<dyn Fn(&SerialSettings) -> Result<Box<dyn SerialTransport>, SpmError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    /// Port identifier, e.g. `/dev/ttyACM0` or `COM5`
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    /// Pause after opening the port while the controller resets
    pub settle_time: Duration,
    /// Query line answered with the current probe signal
    pub signal_query: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(500),
            settle_time: Duration::from_millis(800),
            signal_query: "GET_SIGNAL".to_string(),
        }
    }
}

impl SerialSettings {
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }
}

/// Transport over an OS serial port
pub struct NativeSerialPort {
    reader: BufReader<Box<dyn serialport::SerialPort>>,
    pending: Vec<u8>,
}

impl NativeSerialPort {
    pub fn open(settings: &SerialSettings) -> Result<Box<dyn SerialTransport>, SpmError> {
        let port_name = settings.port.as_deref().ok_or_else(|| {
            SpmError::Configuration("serial port identifier is not set".to_string())
        })?;

        let port = serialport::new(port_name, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| {
                SpmError::Connection(format!(
                    "failed to open serial port {port_name} at {} baud: {e}",
                    settings.baud_rate
                ))
            })?;

        if !settings.settle_time.is_zero() {
            std::thread::sleep(settings.settle_time);
        }

        Ok(Box::new(Self::from_port(port)))
    }

    fn from_port(port: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            reader: BufReader::new(port),
            pending: Vec::new(),
        }
    }
}

impl SerialTransport for NativeSerialPort {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.reader.get_mut();
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => Ok(None),
            Ok(_) if self.pending.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            // Partial line; the rest arrives with a later read
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.reader
            .get_ref()
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialTransport>> {
        let port = self.reader.get_ref().try_clone().map_err(io::Error::from)?;
        Ok(Box::new(Self::from_port(port)))
    }
}

#[derive(Debug, Default)]
struct CachedState {
    position: Position3D,
    feed_rate: Option<f64>,
}

/// Motion backend speaking G-code over a serial line
pub struct SerialBackend {
    settings: SerialSettings,
    opener: PortOpener,
    port: Mutex<Option<Box<dyn SerialTransport>>>,
    stop_line: Mutex<Option<Box<dyn SerialTransport>>>,
    connected: AtomicBool,
    /// Bumped by every emergency stop so an overlapping connect can notice it
    stop_epoch: AtomicU64,
    cache: Mutex<CachedState>,
}

impl SerialBackend {
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_opener(settings, Arc::new(NativeSerialPort::open))
    }

    pub fn with_opener(settings: SerialSettings, opener: PortOpener) -> Self {
        Self {
            settings,
            opener,
            port: Mutex::new(None),
            stop_line: Mutex::new(None),
            connected: AtomicBool::new(false),
            stop_epoch: AtomicU64::new(0),
            cache: Mutex::new(CachedState::default()),
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Send one command and collect its response lines up to the `ok`
    pub fn send_command(&self, command: &str, timeout: Duration) -> Result<Vec<String>, SpmError> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(Vec::new());
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(SpmError::NotConnected);
        }

        let mut port = self.port.lock();
        let result = match port.as_mut() {
            Some(transport) => exchange(transport.as_mut(), command, timeout, &self.connected),
            None => Err(SpmError::NotConnected),
        };

        // An emergency stop closed the connection while we held the port
        if !self.connected.load(Ordering::Acquire) && port.take().is_some() {
            debug!("Released serial port after emergency stop");
        }
        result
    }

    /// Ask the controller for its position (`M114`) and refresh the cache
    pub fn query_position(&self) -> Result<Position3D, SpmError> {
        let lines = self.send_command(protocol::REPORT_POSITION, protocol::STATUS_TIMEOUT)?;
        let position = lines
            .iter()
            .find_map(|line| protocol::parse_position_report(line))
            .ok_or_else(|| {
                SpmError::HardwareFault(format!("malformed position report: {lines:?}"))
            })?;
        self.cache.lock().position = position;
        Ok(position)
    }

    fn send_stop_directive(&self) -> Result<(), SpmError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SpmError::NotConnected);
        }

        if let Some(mut port) = self.port.try_lock() {
            if let Some(transport) = port.as_mut() {
                exchange(
                    transport.as_mut(),
                    protocol::EMERGENCY_STOP,
                    protocol::STOP_TIMEOUT,
                    &self.connected,
                )?;
                return Ok(());
            }
        }

        // A command is in flight; push the directive without waiting for a reply
        let mut stop_line = self.stop_line.lock();
        match stop_line.as_mut() {
            Some(transport) => transport
                .write_line(protocol::EMERGENCY_STOP)
                .map_err(|e| SpmError::HardwareFault(format!("stop directive write failed: {e}"))),
            None => Err(SpmError::HardwareFault(
                "no stop channel available".to_string(),
            )),
        }
    }

    /// Mark disconnected and drop the handles. With `wait == false` a port
    /// held by an in-flight command is released by that command instead.
    fn close(&self, wait: bool) {
        self.connected.store(false, Ordering::Release);
        self.stop_line.lock().take();
        if wait {
            self.port.lock().take();
        } else if let Some(mut port) = self.port.try_lock() {
            port.take();
        }
    }
}

/// Write `command` and read lines until an acknowledgement
fn exchange(
    transport: &mut dyn SerialTransport,
    command: &str,
    timeout: Duration,
    connected: &AtomicBool,
) -> Result<Vec<String>, SpmError> {
    trace!("-> {command}");
    transport
        .write_line(command)
        .map_err(|e| SpmError::HardwareFault(format!("write of '{command}' failed: {e}")))?;

    let mut lines = Vec::new();
    let acknowledged = poll_with_timeout(
        || {
            if !connected.load(Ordering::Acquire) {
                return Err(SpmError::HardwareFault(format!(
                    "connection closed while waiting for '{command}'"
                )));
            }
            let line = transport.read_line().map_err(|e| {
                SpmError::HardwareFault(format!("read after '{command}' failed: {e}"))
            })?;
            match line {
                Some(line) if line.is_empty() => Ok(None),
                Some(line) => {
                    trace!("<- {line}");
                    let done = protocol::is_ack(&line);
                    lines.push(line);
                    Ok(done.then_some(()))
                }
                None => Ok(None),
            }
        },
        timeout,
        Duration::ZERO,
    );

    match acknowledged {
        Ok(Some(())) => {}
        Ok(None) => {
            return Err(SpmError::Timeout(format!(
                "no acknowledgement for '{command}' within {timeout:?}"
            )));
        }
        Err(PollError::ConditionError(e)) => return Err(e),
    }

    if let Some(error) = lines.iter().find(|line| protocol::is_error(line)) {
        return Err(SpmError::HardwareFault(format!(
            "controller rejected '{command}': {error}"
        )));
    }
    Ok(lines)
}

impl MotionBackend for SerialBackend {
    fn name(&self) -> &str {
        self.settings.port.as_deref().unwrap_or("serial")
    }

    fn connect(&self) -> Result<(), SpmError> {
        if self.connected.load(Ordering::Acquire) {
            debug!("Serial backend already connected");
            return Ok(());
        }
        let port_name = self.settings.port.clone().ok_or_else(|| {
            SpmError::Configuration("serial port identifier is not set".to_string())
        })?;

        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        let mut transport = (self.opener)(&self.settings)?;
        if let Err(e) = transport.clear_input() {
            debug!("Could not clear serial buffers on {port_name}: {e}");
        }
        let stop_line = match transport.try_clone() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("No dedicated stop channel on {port_name}: {e}");
                None
            }
        };

        *self.port.lock() = Some(transport);
        *self.stop_line.lock() = stop_line;
        self.connected.store(true, Ordering::SeqCst);

        // A stop that raced the open saw no connection to close
        if self.stop_epoch.load(Ordering::SeqCst) != epoch {
            self.close(true);
            warn!("Emergency stop arrived while connecting to {port_name}, port released");
            return Err(SpmError::Connection(
                "emergency stop during connect".to_string(),
            ));
        }
        info!(
            "Connected to {port_name} at {} baud",
            self.settings.baud_rate
        );

        // Some firmware answers G90 differently; a missing ack is not fatal
        let handshake =
            self.send_command(protocol::ABSOLUTE_POSITIONING, protocol::HANDSHAKE_TIMEOUT);
        if let Err(e) = handshake {
            warn!("Absolute positioning not acknowledged on {port_name}: {e}");
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), SpmError> {
        let was_connected = self.connected.load(Ordering::Acquire);
        self.close(true);
        if was_connected {
            info!("Disconnected from {}", self.name());
        }
        Ok(())
    }

    fn home(&self) -> Result<(), SpmError> {
        self.send_command(protocol::HOME_ALL_AXES, protocol::HOME_TIMEOUT)?;
        self.cache.lock().position = Position3D::default();
        info!("Homing complete");
        Ok(())
    }

    fn move_to(&self, targets: AxisTargets) -> Result<(), SpmError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SpmError::NotConnected);
        }
        let Some(command) = protocol::encode_move(&targets) else {
            return Ok(());
        };

        self.send_command(&command, protocol::MOTION_TIMEOUT)?;

        let mut cache = self.cache.lock();
        cache.position.apply(&targets);
        if targets.feed_rate.is_some() {
            cache.feed_rate = targets.feed_rate;
        }
        Ok(())
    }

    fn get_state(&self) -> BackendState {
        let cache = self.cache.lock();
        BackendState {
            connected: self.connected.load(Ordering::Acquire),
            position: cache.position,
            feed_rate: cache.feed_rate,
            port: self.settings.port.clone(),
            baud_rate: Some(self.settings.baud_rate),
        }
    }

    fn emergency_stop(&self) -> Result<(), SpmError> {
        warn!("Emergency stop requested on {}", self.name());
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.send_stop_directive() {
            warn!("Emergency stop directive not confirmed: {e}");
        }
        self.close(false);
        Ok(())
    }

    fn read_signal(&self) -> Result<f64, SpmError> {
        let lines = self.send_command(&self.settings.signal_query, protocol::STATUS_TIMEOUT)?;
        lines
            .iter()
            .filter(|line| !protocol::is_ack(line))
            .find_map(|line| protocol::parse_signal(line))
            .ok_or_else(|| SpmError::HardwareFault(format!("malformed signal reply: {lines:?}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
