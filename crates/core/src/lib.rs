pub mod config;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use sandsched_errors::{SchedulerError, SchedulerResult};
pub use scheduler::{Scheduler, SchedulerDeps};
