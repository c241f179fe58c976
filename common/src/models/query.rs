//! SQL query models.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::connection_state::{ConnectionState, ConnectionStateMap};

/// Positional query argument.
///
/// Deserialized from plain JSON values: `null`, booleans, integers, floats
/// and strings bind as the matching SQL scalar, objects and arrays as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl From<&str> for QueryArg {
    fn from(value: &str) -> Self {
        QueryArg::Text(value.to_string())
    }
}

impl From<i64> for QueryArg {
    fn from(value: i64) -> Self {
        QueryArg::Int(value)
    }
}

/// Request body for executing a SQL query.
#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct QueryRequest {
    /// SQL statement to execute.
    #[validate(length(min = 1, message = "SQL statement is required"))]
    pub sql: String,

    /// Positional arguments bound to `$1`, `$2`, ...
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub args: Vec<QueryArg>,

    /// Optional per-request ceiling in seconds. The service retry budget
    /// still applies when it is shorter.
    #[serde(default)]
    #[validate(range(min = 1, max = 3600, message = "timeout must be 1-3600 seconds"))]
    pub timeout_secs: Option<u64>,
}

/// Result of a SQL query execution.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct QueryResult {
    /// Column information.
    pub columns: Vec<ColumnInfo>,

    /// Row data (each row is a vector of JSON values).
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows returned.
    #[serde(default)]
    pub row_count: usize,

    /// Query execution time in milliseconds, retries included.
    #[serde(default)]
    pub execution_time_ms: u64,
}

/// Column information in query result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Backend type name.
    pub data_type: String,
}

/// Loading state of every connection, as served by the state endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionStateReport {
    /// Whether every connection is ready.
    pub all_ready: bool,
    /// Whether no connection is still pending or loading.
    pub all_loaded: bool,
    /// Per-connection states in name order.
    pub connections: Vec<ConnectionState>,
}

impl From<&ConnectionStateMap> for ConnectionStateReport {
    fn from(map: &ConnectionStateMap) -> Self {
        Self {
            all_ready: map.all_ready(),
            all_loaded: map.all_loaded(),
            connections: map.iter().cloned().collect(),
        }
    }
}
