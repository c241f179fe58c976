//! Shared data models.

pub mod connection_state;
pub mod query;

pub use connection_state::{ConnectionState, ConnectionStateMap, ConnectionStatus};
pub use query::{ColumnInfo, ConnectionStateReport, QueryArg, QueryRequest, QueryResult};
