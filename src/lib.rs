pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod logger;
pub mod motion;
pub mod scan;
pub mod surface;
pub mod types;
pub mod utils;
pub mod z_control;

pub use config::{AppConfig, load_config};
pub use error::SpmError;
pub use executor::{ScanEvent, ScanExecutor};
pub use job::{Job, ScanJob};
pub use logger::{Logger, SampleLogger};
pub use motion::{
    BackendHandle, BackendLease, MotionBackend, SerialBackend, SerialSettings, SharedBackend,
    SimulatedBackend,
};
pub use scan::{
    AfmContactMode, AfmNonContactMode, HardwareFactory, ProfilingMode, SampleBuffer,
    ScanModeStrategy, SignalSource, StmMode,
};
pub use surface::{SurfaceModel, Topography};
pub use types::{
    AxisTargets, BackendState, ExecutionStatus, Position, Position3D, ProbeMode, RegulationMode,
    ScanAxis, ScanConfig, ScanSample, StepOutcome,
};
pub use z_control::{ControllerState, PidGains, ZAxisController};
