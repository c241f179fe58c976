//! Query retry coordinator.
//!
//! Runs a query and, when it fails because a relation does not exist yet,
//! decides from the live connection state whether the relation is still
//! being loaded. Transient failures are retried at a fixed interval until the
//! schema is ready, the loader fails, or the retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::RetryConfig;
use common::errors::AppError;
use common::models::connection_state::{ConnectionStateMap, ConnectionStatus};
use common::models::QueryArg;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::classifier::{ErrorClassifier, PostgresClassifier, RelationFailure, UNDEFINED_TABLE};
use crate::cancel::{Cancelled, OrCancelExt};
use crate::connection_state::{ConnectionStateSource, StateError, WaitMode};
use crate::search_path::SearchPathManager;
use crate::session::{QueryError, Session};
use crate::status::StatusSink;

const LOADING_RESULTS: &str = "Loading results...";

/// Why [`RetryCoordinator::execute_with_retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The query's own error, returned unchanged.
    #[error(transparent)]
    Query(QueryError),

    /// The connection owning the referenced schema failed to load.
    #[error("connection {schema} failed to load: {detail}")]
    ConnectionFailed { schema: String, detail: String },

    /// Waiting for the search path's first connection failed.
    #[error(transparent)]
    SearchPathWait(StateError),

    /// The schema was still loading when the retry budget ran out.
    #[error("timed out after {elapsed:?} waiting for schema to load: {source}")]
    Timeout {
        elapsed: Duration,
        #[source]
        source: QueryError,
    },

    /// The budget ran out before the first attempt reported anything.
    #[error("query did not complete within {0:?}")]
    Deadline(Duration),

    #[error("query cancelled")]
    Cancelled,
}

impl From<Cancelled> for RetryError {
    fn from(_: Cancelled) -> Self {
        RetryError::Cancelled
    }
}

impl From<RetryError> for AppError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Query(QueryError::Driver(e)) => AppError::DatabaseConnection(e.to_string()),
            RetryError::Query(q) if q.code() == Some(UNDEFINED_TABLE) => {
                AppError::RelationNotFound(q.to_string())
            }
            RetryError::Query(q) => AppError::QueryFailed(q.to_string()),
            err @ (RetryError::ConnectionFailed { .. } | RetryError::SearchPathWait(_)) => {
                AppError::ConnectionLoadFailed(err.to_string())
            }
            err @ (RetryError::Timeout { .. } | RetryError::Deadline(_)) => {
                AppError::QueryTimeout(err.to_string())
            }
            RetryError::Cancelled => AppError::Cancelled,
        }
    }
}

/// Verdict on one relation-not-found failure.
enum Verdict {
    Retry,
    /// Permanent; the query's own error is returned.
    Original,
    Fail(RetryError),
}

/// Executes queries, waiting out schemas that are still loading.
///
/// Holds no per-call state, so one coordinator can serve concurrent callers.
pub struct RetryCoordinator<C: Session> {
    config: RetryConfig,
    state_source: Arc<dyn ConnectionStateSource<C>>,
    search_path: Arc<dyn SearchPathManager<C>>,
    status: Arc<dyn StatusSink>,
    classifier: Box<dyn ErrorClassifier>,
}

impl<C: Session> RetryCoordinator<C> {
    /// Creates a coordinator that classifies PostgreSQL errors.
    pub fn new(
        config: RetryConfig,
        state_source: Arc<dyn ConnectionStateSource<C>>,
        search_path: Arc<dyn SearchPathManager<C>>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            config,
            state_source,
            search_path,
            status,
            classifier: Box::new(PostgresClassifier::new()),
        }
    }

    /// Replaces the error classifier, for backends with other error shapes.
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// Runs `query` on `conn`, retrying while its schema is still loading.
    ///
    /// Only relation-not-found failures are ever retried. Cancelling `cancel`
    /// aborts the in-flight query, state wait or backoff sleep and returns
    /// [`RetryError::Cancelled`].
    pub async fn execute_with_retry(
        &self,
        cancel: &CancellationToken,
        conn: &mut C,
        query: &str,
        args: &[QueryArg],
    ) -> Result<C::Rows, RetryError> {
        self.execute_within(cancel, conn, query, args, self.config.max_duration)
            .await
    }

    /// [`execute_with_retry`](Self::execute_with_retry) with a per-call budget.
    ///
    /// `max_duration` bounds the whole call: queries, state waits and backoff
    /// sleeps. Running out after a relation-not-found failure returns
    /// [`RetryError::Timeout`] carrying the latest such failure.
    pub async fn execute_within(
        &self,
        cancel: &CancellationToken,
        conn: &mut C,
        query: &str,
        args: &[QueryArg],
        max_duration: Duration,
    ) -> Result<C::Rows, RetryError> {
        let started = Instant::now();
        let deadline = started + max_duration;
        let mut last_err: Option<QueryError> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let executed =
                tokio::time::timeout_at(deadline, conn.execute(query, args).or_cancel(cancel))
                    .await;
            let query_err = match executed {
                Err(_) => return Err(self.out_of_time(attempt, started, last_err)),
                Ok(Err(Cancelled)) => return Err(RetryError::Cancelled),
                Ok(Ok(Ok(rows))) => {
                    self.status.set_status(LOADING_RESULTS);
                    return Ok(rows);
                }
                Ok(Ok(Err(err))) => err,
            };

            let Some(failure) = self.classifier.classify(&query_err) else {
                return Err(RetryError::Query(query_err));
            };
            tracing::debug!(
                attempt,
                schema = failure.schema.as_deref().unwrap_or(""),
                relation = failure.relation.as_deref().unwrap_or(""),
                "Relation not found, checking connection state"
            );

            let decided = tokio::time::timeout_at(
                deadline,
                self.decide(cancel, conn, &failure, &query_err),
            )
            .await;
            match decided {
                Err(_) => return Err(self.out_of_time(attempt, started, Some(query_err))),
                Ok(Verdict::Original) => return Err(RetryError::Query(query_err)),
                Ok(Verdict::Fail(err)) => return Err(err),
                Ok(Verdict::Retry) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.out_of_time(attempt, started, Some(query_err)));
            }
            let delay = self.config.backoff_interval.min(remaining);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying query");
            tokio::time::sleep(delay).or_cancel(cancel).await?;
            last_err = Some(query_err);
        }
    }

    fn out_of_time(&self, attempt: u32, started: Instant, last_err: Option<QueryError>) -> RetryError {
        let elapsed = started.elapsed();
        tracing::warn!(
            attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            error = last_err.as_ref().map(tracing::field::display),
            "Retry budget exhausted"
        );
        match last_err {
            Some(source) => RetryError::Timeout { elapsed, source },
            None => RetryError::Deadline(elapsed),
        }
    }

    async fn decide(
        &self,
        cancel: &CancellationToken,
        conn: &mut C,
        failure: &RelationFailure,
        query_err: &QueryError,
    ) -> Verdict {
        let snapshot = match self
            .state_source
            .load_snapshot(conn, WaitMode::UntilLoading)
            .or_cancel(cancel)
            .await
        {
            Err(Cancelled) => return Verdict::Fail(RetryError::Cancelled),
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Connection state unavailable");
                return Verdict::Original;
            }
        };
        if snapshot.is_empty() {
            return Verdict::Original;
        }

        match failure.schema.as_deref() {
            None => self.unqualified(cancel, conn, &snapshot, query_err).await,
            Some(schema) => self.qualified(schema, &snapshot),
        }
    }

    /// The query relied on the search path, so any loading connection may
    /// hold the missing relation.
    async fn unqualified(
        &self,
        cancel: &CancellationToken,
        conn: &mut C,
        snapshot: &ConnectionStateMap,
        query_err: &QueryError,
    ) -> Verdict {
        if snapshot.all_loaded() && snapshot.is_stable(Utc::now(), self.config.backoff_interval) {
            return Verdict::Original;
        }

        // the set of schemas may have changed while connections were loading
        match self.search_path.refresh_search_path(conn).or_cancel(cancel).await {
            Err(Cancelled) => return Verdict::Fail(RetryError::Cancelled),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Search path refresh failed");
                return Verdict::Original;
            }
            Ok(Ok(())) => {}
        }
        self.search_path.recompute_required_search_path();
        match self
            .search_path
            .ensure_session_search_path(conn)
            .or_cancel(cancel)
            .await
        {
            Err(Cancelled) => return Verdict::Fail(RetryError::Cancelled),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Could not apply session search path");
                return Verdict::Original;
            }
            Ok(Ok(())) => {}
        }

        let required = self.search_path.required_search_path();
        let waiting_on = required
            .iter()
            .find(|s| snapshot.get(s).is_some_and(|state| !state.status.is_loaded()));
        self.status.set_status(&match waiting_on {
            Some(schema) => snapshot.loading_status_message(schema),
            None => snapshot.progress_message(),
        });

        match self
            .state_source
            .load_snapshot(conn, WaitMode::ForSearchPath(required))
            .or_cancel(cancel)
            .await
        {
            Err(Cancelled) => Verdict::Fail(RetryError::Cancelled),
            Ok(Ok(_)) => Verdict::Retry,
            // still loading; the retry budget decides when to stop
            Ok(Err(StateError::WaitTimeout(waited))) => {
                tracing::debug!(waited_ms = waited.as_millis() as u64, "Search path wait timed out");
                Verdict::Retry
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, query_error = %query_err, "Search path wait failed");
                Verdict::Fail(RetryError::SearchPathWait(err))
            }
        }
    }

    /// The query named its schema, so only that connection matters.
    fn qualified(&self, schema: &str, snapshot: &ConnectionStateMap) -> Verdict {
        let Some(state) = snapshot.get(schema) else {
            // not a configured connection, waiting will not help
            return Verdict::Original;
        };

        match state.status {
            ConnectionStatus::Ready if state.is_stable(Utc::now(), self.config.backoff_interval) => {
                Verdict::Original
            }
            ConnectionStatus::Error => Verdict::Fail(RetryError::ConnectionFailed {
                schema: schema.to_string(),
                detail: state.error_detail().unwrap_or("unknown error").to_string(),
            }),
            ConnectionStatus::Disabled => Verdict::Original,
            ConnectionStatus::Pending | ConnectionStatus::Loading | ConnectionStatus::Ready => {
                self.status
                    .set_status(&snapshot.loading_status_message(schema));
                Verdict::Retry
            }
        }
    }
}
