pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod render;
pub mod session;
pub mod transport;

pub use error::{CancelReason, Error, Failure, Result, TaskResult};
pub use session::{Outcome, Phase, RunHandle, RunId, Session, SessionState};
