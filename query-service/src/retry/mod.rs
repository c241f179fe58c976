//! Retrying queries that race a background schema load.

pub mod classifier;
pub mod coordinator;

pub use classifier::{ErrorClassifier, PostgresClassifier, RelationFailure, UNDEFINED_TABLE};
pub use coordinator::{RetryCoordinator, RetryError};
