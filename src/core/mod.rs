//! Core scheduling: tasks, actions, resource accounting and the scheduler loop.

pub mod action;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recompose;
pub mod resource_pool;
pub mod runner;
pub mod scheduler;
pub mod scope;
pub mod task;
pub mod tick;
pub mod validator;

pub use action::{Action, ActionKind, Recovered, Run, RunRecord};
pub use error::{AppResult, ErrorKind, SchedulerError};
pub use events::{Event, PubSub};
pub use resource_pool::{ResourceSnapshot, Resources, Spawn};
pub use runner::{Runner, WorkdirRunner};
pub use scheduler::Scheduler;
pub use scope::{ExecScope, ScopeEnd, TaskCancel};
pub use task::{Status, Task};
pub use validator::{Validator, ValidatorRegistry};
