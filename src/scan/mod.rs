//! Scan mode strategies
//!
//! A [`ScanModeStrategy`] advances a scan one raster point at a time. The
//! executor owns the strategy for the duration of a run and drives it through
//! [`initialize`](ScanModeStrategy::initialize), repeated
//! [`step`](ScanModeStrategy::step) calls and a final
//! [`finalize`](ScanModeStrategy::finalize).

pub mod hardware;
pub mod modes;
pub mod raster;

pub use hardware::{HardwareFactory, ScanHardware, SignalSource};
pub use modes::{AfmContactMode, AfmNonContactMode, ProfilingMode, StmMode};
pub use raster::RasterCursor;

use ndarray::Array2;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::SpmError;
use crate::motion::SharedBackend;
use crate::types::{ProbeMode, ScanConfig, ScanSample, StepOutcome};
use crate::z_control::ZAxisController;

pub trait ScanModeStrategy: Send {
    fn mode(&self) -> ProbeMode;

    /// Prepare hardware and state for a fresh scan
    ///
    /// Calling it twice without an intervening step leaves the strategy in the
    /// same state as calling it once.
    fn initialize(&mut self, config: &ScanConfig) -> Result<(), SpmError>;

    /// Measure one raster point. Returns [`StepOutcome::Done`] once the raster
    /// is exhausted, without recording a sample.
    fn step(&mut self) -> Result<StepOutcome, SpmError>;

    /// Release hardware acquired by `initialize`. No-op when never initialized.
    fn finalize(&mut self) -> Result<(), SpmError>;

    fn backend(&self) -> &SharedBackend;

    fn controller(&self) -> &ZAxisController;

    fn controller_mut(&mut self) -> &mut ZAxisController;

    /// Handle to the buffer samples are appended to
    fn samples(&self) -> &SampleBuffer;
}

#[derive(Debug, Default)]
struct BufferInner {
    samples: Vec<ScanSample>,
    capacity: usize,
    frozen: bool,
}

/// Append-only sample store shared between a strategy and its observers
///
/// Clones share the same storage. Readers always receive a copy.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    inner: Arc<RwLock<BufferInner>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all samples and accept up to `capacity` new ones
    pub fn reset(&self, capacity: usize) {
        let mut inner = self.inner.write();
        inner.samples.clear();
        inner.capacity = capacity;
        inner.frozen = false;
    }

    pub fn push(&self, sample: ScanSample) -> Result<(), SpmError> {
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(SpmError::invalid_state("append sample", "frozen"));
        }
        if inner.samples.len() >= inner.capacity {
            return Err(SpmError::invalid_state(
                "append sample",
                format!("full ({} samples)", inner.capacity),
            ));
        }
        inner.samples.push(sample);
        Ok(())
    }

    /// Reject further appends until the next reset
    pub fn freeze(&self) {
        self.inner.write().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    pub fn snapshot(&self) -> Vec<ScanSample> {
        self.inner.read().samples.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    pub fn last(&self) -> Option<ScanSample> {
        self.inner.read().samples.last().copied()
    }
}

/// Arrange samples as a `[row, column]` grid of corrected Z values
///
/// Profiling scans give a single row. Grid points without a sample are NaN.
pub fn height_map(samples: &[ScanSample], config: &ScanConfig) -> Array2<f64> {
    let cursor = RasterCursor::for_config(config);
    let rows = if config.mode().is_area() {
        config.resolution()
    } else {
        1
    };
    let mut map = Array2::from_elem((rows, config.resolution()), f64::NAN);
    for (n, sample) in samples.iter().take(cursor.total()).enumerate() {
        map[cursor.grid_index(n)] = sample.z_corrected;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;

    fn sample(z: f64) -> ScanSample {
        ScanSample::new(Position::new(0.0, 0.0), z, 0.0)
    }

    #[test]
    fn test_buffer_capacity() {
        let buffer = SampleBuffer::new();
        buffer.reset(2);
        buffer.push(sample(1.0)).unwrap();
        buffer.push(sample(2.0)).unwrap();

        assert!(matches!(
            buffer.push(sample(3.0)),
            Err(SpmError::InvalidState { .. })
        ));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_large_capacity_grows_on_demand() {
        let buffer = SampleBuffer::new();
        buffer.reset(usize::MAX);
        assert_eq!(buffer.capacity(), usize::MAX);

        buffer.push(sample(1.0)).unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_frozen_buffer_rejects_appends() {
        let buffer = SampleBuffer::new();
        buffer.reset(10);
        buffer.push(sample(1.0)).unwrap();
        buffer.freeze();

        assert!(buffer.push(sample(2.0)).is_err());
        assert_eq!(buffer.snapshot().len(), 1);

        buffer.reset(10);
        assert!(!buffer.is_frozen());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buffer = SampleBuffer::new();
        buffer.reset(4);
        buffer.push(sample(1.0)).unwrap();

        let mut snapshot = buffer.snapshot();
        snapshot.clear();
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_clones_share_storage() {
        let buffer = SampleBuffer::new();
        let observer = buffer.clone();
        buffer.reset(1);
        buffer.push(sample(4.0)).unwrap();
        assert_eq!(observer.last().map(|s| s.z_corrected), Some(4.0));
    }

    #[test]
    fn test_height_map_undoes_serpentine() {
        let config = ScanConfig::builder(ProbeMode::Stm)
            .scan_size(1.0)
            .resolution(2)
            .build()
            .unwrap();
        // Visit order: (0,0) (1,0) (1,1) (0,1)
        let samples: Vec<_> = [0.0, 1.0, 2.0, 3.0].into_iter().map(sample).collect();
        let map = height_map(&samples, &config);

        assert_eq!(map.dim(), (2, 2));
        assert_eq!(map[[0, 0]], 0.0);
        assert_eq!(map[[0, 1]], 1.0);
        assert_eq!(map[[1, 1]], 2.0);
        assert_eq!(map[[1, 0]], 3.0);
    }

    #[test]
    fn test_height_map_partial_scan() {
        let config = ScanConfig::builder(ProbeMode::Profiling)
            .resolution(3)
            .build()
            .unwrap();
        let map = height_map(&[sample(0.5)], &config);

        assert_eq!(map.dim(), (1, 3));
        assert_eq!(map[[0, 0]], 0.5);
        assert!(map[[0, 2]].is_nan());
    }
}
