//! SQL execution primitive.
//!
//! A [`Session`] is an open backend connection owned by the caller. The
//! retry coordinator reuses it unmodified across attempts, apart from the
//! session search path.

use async_trait::async_trait;
use common::models::QueryArg;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, Postgres};
use thiserror::Error;

/// Failure reported by a [`Session`].
#[derive(Debug, Error)]
pub enum QueryError {
    /// The backend rejected the statement.
    #[error("{message}")]
    Database {
        /// SQLSTATE code, when the backend supplied one.
        code: Option<String>,
        message: String,
    },

    /// Anything that is not a backend response: I/O, pool, protocol, decode.
    #[error(transparent)]
    Driver(sqlx::Error),
}

impl QueryError {
    /// Builds a backend error with a SQLSTATE code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::Database {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// SQLSTATE code of a backend error.
    pub fn code(&self) -> Option<&str> {
        match self {
            QueryError::Database { code, .. } => code.as_deref(),
            QueryError::Driver(_) => None,
        }
    }
}

impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => QueryError::Database {
                code: db_err.code().map(|c| c.into_owned()),
                message: db_err.message().to_string(),
            },
            other => QueryError::Driver(other),
        }
    }
}

/// An open connection that can run a statement.
#[async_trait]
pub trait Session: Send {
    type Rows: Send;

    /// Runs `query` with positional `args` and returns its rows.
    async fn execute(&mut self, query: &str, args: &[QueryArg]) -> Result<Self::Rows, QueryError>;
}

#[async_trait]
impl Session for PgConnection {
    type Rows = Vec<PgRow>;

    async fn execute(&mut self, query: &str, args: &[QueryArg]) -> Result<Vec<PgRow>, QueryError> {
        let statement = args.iter().fold(sqlx::query(query), bind_arg);
        Ok(statement.fetch_all(&mut *self).await?)
    }
}

fn bind_arg<'q>(
    statement: Query<'q, Postgres, PgArguments>,
    arg: &'q QueryArg,
) -> Query<'q, Postgres, PgArguments> {
    match arg {
        QueryArg::Null => statement.bind(None::<String>),
        QueryArg::Bool(v) => statement.bind(*v),
        QueryArg::Int(v) => statement.bind(*v),
        QueryArg::Float(v) => statement.bind(*v),
        QueryArg::Text(v) => statement.bind(v.as_str()),
        QueryArg::Json(v) => statement.bind(sqlx::types::Json(v.clone())),
    }
}
