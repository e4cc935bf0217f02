pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{RefineryError, Result};
pub use event::EventBus;
pub use status::{ExecutionStatus, StepStatus};
pub use types::*;
