//! Configuration models for the scheduler, its directories and validators.

pub mod scheduler;

pub use scheduler::SchedulerConfig;
