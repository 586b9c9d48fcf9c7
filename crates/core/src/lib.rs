// Core types and functionality for the reelflow pipeline engine

pub mod actions;
pub mod config;
pub mod connectors;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use actions::PipelineActions;
pub use error::{ConnectorError, PipelineError, SchedulerError, StoreError, TaskError};
pub use types::*;
