//! Job queue: priority, timing-window, and retry scheduling for run jobs.

mod job;
mod store;

pub use job::{Job, JobPriority, JobStatus, retry_delay};
pub use store::{JobQueue, RunJobTally};
