pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod services;

pub use config::Settings;
pub use context::RunContext;
pub use crate::core::pipeline::{Collaborators, Pipeline};
pub use crate::core::report::{RunOutcome, RunReport, Stage, StageStatus};
pub use error::{PipelineError, Result};
