//! Session search path.
//!
//! Unqualified queries resolve relations through the search path. While
//! connections are loading the set of schemas changes, so the path has to be
//! refreshed and re-applied before an unqualified query is retried.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use common::config::{SearchPathConfig, INTERNAL_SCHEMA};
use sqlx::PgConnection;

use crate::connection_state::StateError;

/// Tracks which schemas unqualified queries should see.
#[async_trait]
pub trait SearchPathManager<C: Send>: Send + Sync {
    /// Reloads the user's search path from the backend.
    async fn refresh_search_path(&self, conn: &mut C) -> Result<(), StateError>;

    /// Recomputes the path sessions must use from the last refresh.
    fn recompute_required_search_path(&self);

    /// The required path, in resolution order.
    fn required_search_path(&self) -> Vec<String>;

    /// Applies the required path to the session.
    async fn ensure_session_search_path(&self, conn: &mut C) -> Result<(), StateError>;
}

#[derive(Debug, Default)]
struct SearchPaths {
    user: Vec<String>,
    required: Vec<String>,
}

/// Search path manager backed by the connection state table.
///
/// Without an explicit `SEARCH_PATH` the user path is `public` followed by
/// every known connection in name order.
pub struct PgSearchPathManager {
    config: SearchPathConfig,
    names_sql: String,
    paths: RwLock<SearchPaths>,
}

impl PgSearchPathManager {
    pub fn new(config: SearchPathConfig, state_table: &str) -> Self {
        let names_sql = format!(
            "SELECT name FROM {} ORDER BY name",
            quote_qualified(state_table)
        );
        Self {
            config,
            names_sql,
            paths: RwLock::new(SearchPaths::default()),
        }
    }

    fn set_user_path(&self, user: Vec<String>) {
        let mut paths = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        paths.user = user;
    }
}

#[async_trait]
impl SearchPathManager<PgConnection> for PgSearchPathManager {
    async fn refresh_search_path(&self, conn: &mut PgConnection) -> Result<(), StateError> {
        if !self.config.search_path.is_empty() {
            self.set_user_path(self.config.search_path.clone());
            return Ok(());
        }

        let names: Vec<String> = sqlx::query_scalar(&self.names_sql)
            .fetch_all(&mut *conn)
            .await?;
        let user = std::iter::once("public".to_string()).chain(names).collect();
        self.set_user_path(user);
        Ok(())
    }

    fn recompute_required_search_path(&self) {
        let mut paths = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        paths.required = required_path(&self.config.search_path_prefix, &paths.user);
        tracing::debug!(search_path = ?paths.required, "Required search path recomputed");
    }

    fn required_search_path(&self) -> Vec<String> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .required
            .clone()
    }

    async fn ensure_session_search_path(&self, conn: &mut PgConnection) -> Result<(), StateError> {
        let required = self.required_search_path();
        if required.is_empty() {
            return Ok(());
        }
        let sql = format!("SET search_path TO {}", join_idents(&required));
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }
}

/// Prefix, then the user path, then the internal schema; first occurrence wins.
pub fn required_path(prefix: &[String], user: &[String]) -> Vec<String> {
    let mut required: Vec<String> = Vec::with_capacity(prefix.len() + user.len() + 1);
    let internal = INTERNAL_SCHEMA.to_string();
    for schema in prefix.iter().chain(user).chain(std::iter::once(&internal)) {
        if !required.contains(schema) {
            required.push(schema.clone());
        }
    }
    required
}

/// Quotes a single identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes each dot-separated part of a possibly schema-qualified name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn join_idents(schemas: &[String]) -> String {
    schemas
        .iter()
        .map(|s| quote_ident(s))
        .collect::<Vec<_>>()
        .join(", ")
}
