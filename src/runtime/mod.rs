//! Runtime adapters and the API surface.

pub mod api;
pub mod tokio_spawner;

pub use api::{ApiResponse, BodyFormat, Owner, TaskSubmission};
pub use tokio_spawner::TokioSpawner;
