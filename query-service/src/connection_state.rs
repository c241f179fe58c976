//! Connection state snapshots.
//!
//! The background loaders record each connection's progress in a state
//! table. A [`ConnectionStateSource`] reads it into a fresh
//! [`ConnectionStateMap`], optionally blocking until a condition holds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::StateConfig;
use common::models::connection_state::{
    ConnectionState, ConnectionStateMap, ConnectionStatus, UnknownStatus,
};
use sqlx::PgConnection;
use thiserror::Error;
use tokio::time::Instant;

use crate::retry::UNDEFINED_TABLE;
use crate::search_path::quote_qualified;

/// Failure to obtain a snapshot.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read connection state: {0}")]
    Query(#[from] sqlx::Error),

    #[error("connection '{name}' has an invalid status: {source}")]
    InvalidStatus {
        name: String,
        #[source]
        source: UnknownStatus,
    },

    /// The connection being waited for ended in error.
    #[error("connection {name} failed to load: {detail}")]
    ConnectionFailed { name: String, detail: String },

    #[error("timed out after {0:?} waiting for connection state")]
    WaitTimeout(Duration),
}

/// Condition a snapshot must satisfy before it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitMode {
    /// Return whatever is there.
    Immediate,
    /// Wait until the state table exists and no connection is pending.
    UntilLoading,
    /// Wait until the first connection named in this search path is ready.
    ///
    /// Schemas that are not connections (`public`, say) are skipped. Fails if
    /// that connection ends in error.
    ForSearchPath(Vec<String>),
}

impl WaitMode {
    /// Whether `map` satisfies the condition.
    pub fn is_satisfied(&self, map: &ConnectionStateMap) -> Result<bool, StateError> {
        match self {
            WaitMode::Immediate => Ok(true),
            WaitMode::UntilLoading => Ok(map.pending_count() == 0),
            WaitMode::ForSearchPath(path) => {
                let Some(first) = path.iter().find_map(|schema| map.get(schema)) else {
                    return Ok(true);
                };
                match first.status {
                    ConnectionStatus::Error => Err(StateError::ConnectionFailed {
                        name: first.name.clone(),
                        detail: first.error_detail().unwrap_or_default().to_string(),
                    }),
                    ConnectionStatus::Pending | ConnectionStatus::Loading => Ok(false),
                    ConnectionStatus::Ready | ConnectionStatus::Disabled => Ok(true),
                }
            }
        }
    }

    fn blocks(&self) -> bool {
        !matches!(self, WaitMode::Immediate)
    }
}

/// Source of connection state snapshots.
///
/// Implementations must return a freshly read snapshot on every call.
#[async_trait]
pub trait ConnectionStateSource<C: Send>: Send + Sync {
    async fn load_snapshot(
        &self,
        conn: &mut C,
        mode: WaitMode,
    ) -> Result<ConnectionStateMap, StateError>;
}

#[derive(sqlx::FromRow)]
struct StateRow {
    name: String,
    state: String,
    error: Option<String>,
    last_modified: DateTime<Utc>,
}

impl StateRow {
    fn into_state(self) -> Result<ConnectionState, StateError> {
        let status: ConnectionStatus =
            self.state
                .parse()
                .map_err(|source| StateError::InvalidStatus {
                    name: self.name.clone(),
                    source,
                })?;
        Ok(match status {
            ConnectionStatus::Error => ConnectionState::failed(
                self.name,
                self.error.unwrap_or_else(|| "unknown error".to_string()),
                self.last_modified,
            ),
            other => ConnectionState::new(self.name, other, self.last_modified),
        })
    }
}

/// Reads connection state from the loaders' state table.
pub struct PgConnectionStateSource {
    config: StateConfig,
    select_sql: String,
}

impl PgConnectionStateSource {
    pub fn new(config: StateConfig) -> Self {
        let select_sql = format!(
            "SELECT name, state, error, last_modified FROM {}",
            quote_qualified(&config.table)
        );
        Self { config, select_sql }
    }

    async fn read(&self, conn: &mut PgConnection) -> Result<ConnectionStateMap, StateError> {
        let rows: Vec<StateRow> = sqlx::query_as(&self.select_sql)
            .fetch_all(&mut *conn)
            .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }
}

#[async_trait]
impl ConnectionStateSource<PgConnection> for PgConnectionStateSource {
    async fn load_snapshot(
        &self,
        conn: &mut PgConnection,
        mode: WaitMode,
    ) -> Result<ConnectionStateMap, StateError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            match self.read(conn).await {
                Ok(map) => {
                    if mode.is_satisfied(&map)? {
                        return Ok(map);
                    }
                    tracing::debug!(
                        ?mode,
                        connections = map.len(),
                        loaded = map.loaded_count(),
                        "Connection state not settled yet"
                    );
                }
                Err(StateError::Query(err)) if mode.blocks() && is_undefined_table(&err) => {
                    tracing::debug!(table = %self.config.table, "Connection state table not created yet");
                }
                Err(err) => return Err(err),
            }

            if Instant::now() >= deadline {
                return Err(StateError::WaitTimeout(self.config.wait_timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNDEFINED_TABLE),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(states: &[(&str, ConnectionStatus)]) -> ConnectionStateMap {
        states
            .iter()
            .map(|(name, status)| match status {
                ConnectionStatus::Error => ConnectionState::failed(*name, "plugin crashed", Utc::now()),
                other => ConnectionState::new(*name, *other, Utc::now()),
            })
            .collect()
    }

    fn path(schemas: &[&str]) -> WaitMode {
        WaitMode::ForSearchPath(schemas.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_until_loading_waits_for_pending() {
        let pending = map(&[("aws", ConnectionStatus::Pending), ("gcp", ConnectionStatus::Loading)]);
        assert!(!WaitMode::UntilLoading.is_satisfied(&pending).unwrap());

        let loading = map(&[("aws", ConnectionStatus::Loading), ("gcp", ConnectionStatus::Ready)]);
        assert!(WaitMode::UntilLoading.is_satisfied(&loading).unwrap());
    }

    #[test]
    fn test_search_path_skips_non_connection_schemas() {
        let states = map(&[("aws", ConnectionStatus::Loading), ("gcp", ConnectionStatus::Ready)]);
        assert!(!path(&["public", "aws", "gcp"]).is_satisfied(&states).unwrap());
        assert!(path(&["public", "gcp", "aws"]).is_satisfied(&states).unwrap());
        assert!(path(&["public", "internal"]).is_satisfied(&states).unwrap());
        assert!(path(&[]).is_satisfied(&states).unwrap());
    }

    #[test]
    fn test_search_path_fails_on_errored_connection() {
        let states = map(&[("aws", ConnectionStatus::Error)]);
        let err = path(&["aws"]).is_satisfied(&states).unwrap_err();
        assert_eq!(err.to_string(), "connection aws failed to load: plugin crashed");
    }

    #[test]
    fn test_row_conversion_enforces_error_detail() {
        let row = StateRow {
            name: "aws".into(),
            state: "error".into(),
            error: None,
            last_modified: Utc::now(),
        };
        let state = row.into_state().unwrap();
        assert_eq!(state.error_detail(), Some("unknown error"));

        let row = StateRow {
            name: "gcp".into(),
            state: "ready".into(),
            error: Some("leftover".into()),
            last_modified: Utc::now(),
        };
        assert_eq!(row.into_state().unwrap().error, None);
    }

    #[test]
    fn test_row_with_unknown_status() {
        let row = StateRow {
            name: "aws".into(),
            state: "rebooting".into(),
            error: None,
            last_modified: Utc::now(),
        };
        assert!(matches!(
            row.into_state(),
            Err(StateError::InvalidStatus { name, .. }) if name == "aws"
        ));
    }

    #[test]
    fn test_select_uses_quoted_table() {
        let source = PgConnectionStateSource::new(StateConfig::default());
        assert_eq!(
            source.select_sql,
            r#"SELECT name, state, error, last_modified FROM "internal"."connection_state""#
        );
    }
}
