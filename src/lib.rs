pub mod capture;
pub mod config;
pub mod error;
pub mod kafka;
pub mod postgres;
pub mod replay;
pub mod sql;
pub mod telemetry;

pub use capture::CaptureService;
pub use config::Config;
pub use error::{Error, Result};
pub use replay::{MessageOutcome, ReplayExecutor};
