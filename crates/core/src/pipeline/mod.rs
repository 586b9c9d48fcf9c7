//! Pipeline definitions and the machinery that runs them.

pub mod dag;
pub mod definition;
pub mod monitor;
pub mod movies;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use dag::{PipelineDag, Resolution};
pub use definition::{PipelineBuilder, PipelineDefinition, TaskAction, TaskSpec, Upstream};
pub use monitor::{FailureReport, RunMonitor, RunReport, ShortCircuitReport, TaskReport};
pub use movies::movie_pipeline;
pub use retry::{Backoff, RetryPolicy};
pub use runner::{TaskContext, TaskOutcome, TaskRunner};
pub use scheduler::{cancel_detached, Scheduler};
