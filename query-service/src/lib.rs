//! Query execution that tolerates schemas still being loaded.
//!
//! Connections are loaded into the backend by independent background
//! loaders. A query that races a loader fails with `relation ... does not
//! exist` even though the relation will appear shortly. The
//! [`RetryCoordinator`](retry::RetryCoordinator) tells those transient
//! failures apart from permanent ones by consulting the published
//! connection state, and retries until the schema is ready.

pub mod cancel;
pub mod connection_state;
pub mod retry;
pub mod search_path;
pub mod session;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use connection_state::{ConnectionStateSource, PgConnectionStateSource, StateError, WaitMode};
pub use retry::{ErrorClassifier, PostgresClassifier, RelationFailure, RetryCoordinator, RetryError};
pub use search_path::{PgSearchPathManager, SearchPathManager};
pub use session::{QueryError, Session};
pub use status::{StatusSink, TracingStatus, WatchStatus};
