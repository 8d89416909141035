pub mod service;
pub mod types;

pub use service::{CronJobCallback, CronService};
pub use types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore};
