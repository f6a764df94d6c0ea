// Background Jobs
//
// Scheduled maintenance for the analytics store.

pub mod scheduler;

pub use scheduler::{JobError, JobResult, JobScheduler};
