use log::{info, warn};
use std::time::Duration;

use crate::error::SpmError;
use crate::executor::ScanExecutor;
use crate::scan::ScanModeStrategy;
use crate::types::{ExecutionStatus, ScanConfig, ScanSample};

/// A trait for long-running processes that can succeed, fail, or timeout
pub trait Job {
    /// The type returned on successful completion
    type Output;

    /// Run the job with a timeout
    ///
    /// Returns:
    /// - `Ok(output)` if the job completes successfully
    /// - `Err(SpmError)` if the job fails or times out
    fn run(&mut self, timeout: Duration) -> Result<Self::Output, SpmError>;
}

/// One scan run to completion on its own executor
pub struct ScanJob {
    executor: ScanExecutor,
    strategy: Option<Box<dyn ScanModeStrategy>>,
}

impl ScanJob {
    pub fn new(config: ScanConfig, strategy: Box<dyn ScanModeStrategy>) -> Self {
        Self {
            executor: ScanExecutor::new(config),
            strategy: Some(strategy),
        }
    }

    /// Executor driving the job, e.g. for pause/stop from another thread
    pub fn executor(&self) -> &ScanExecutor {
        &self.executor
    }
}

impl Job for ScanJob {
    type Output = Vec<ScanSample>;

    /// Samples of a completed scan. A scan still active at the deadline is
    /// stopped and reported as [`SpmError::Timeout`].
    fn run(&mut self, timeout: Duration) -> Result<Self::Output, SpmError> {
        let strategy = self
            .strategy
            .take()
            .ok_or_else(|| SpmError::invalid_state("run job", self.executor.get_status()))?;
        self.executor.start(strategy)?;

        match self.executor.wait(timeout) {
            ExecutionStatus::Completed => {
                let samples = self.executor.get_data();
                info!("Scan job completed with {} samples", samples.len());
                Ok(samples)
            }
            ExecutionStatus::Failed(reason) => Err(SpmError::ScanFailed(reason)),
            ExecutionStatus::Aborted => Err(SpmError::invalid_state("finish job", "aborted")),
            status => {
                warn!("Scan job still {status} after {timeout:?}, stopping");
                if let Err(e) = self.executor.stop() {
                    warn!("Stopping timed out scan job: {e}");
                }
                Err(SpmError::Timeout(format!(
                    "scan did not finish within {timeout:?}"
                )))
            }
        }
    }
}
