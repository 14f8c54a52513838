//! Execution Monitoring Module
//!
//! Progress feeds for running executions and timing reports for
//! finished ones.
//!
//! # Components
//!
//! - [`ProgressChannel`]: Latest-snapshot push channel per execution
//! - [`ExecutionTimeline`]: Step timings and Gantt charts

pub mod progress;
pub mod timeline;

pub use progress::{ProgressChannel, ProgressReceiver};
pub use timeline::{ExecutionTimeline, TimelineEntry};
