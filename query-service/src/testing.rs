//! In-memory collaborators for coordinator tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::models::connection_state::{ConnectionState, ConnectionStateMap, ConnectionStatus};
use common::models::QueryArg;

use crate::connection_state::{ConnectionStateSource, StateError, WaitMode};
use crate::retry::UNDEFINED_TABLE;
use crate::search_path::SearchPathManager;
use crate::session::{QueryError, Session};
use crate::status::StatusSink;

/// Shared record of collaborator calls, in call order.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn note(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

type Respond = Box<dyn FnMut(usize) -> Result<String, QueryError> + Send>;

/// Session whose responses are scripted per attempt (1-based).
pub(crate) struct FakeSession {
    pub attempts: usize,
    respond: Respond,
    hang_from: Option<usize>,
}

impl FakeSession {
    pub fn new(respond: impl FnMut(usize) -> Result<String, QueryError> + Send + 'static) -> Self {
        Self {
            attempts: 0,
            respond: Box::new(respond),
            hang_from: None,
        }
    }

    /// Attempts from `attempt` on never return.
    pub fn hanging_from(mut self, attempt: usize) -> Self {
        self.hang_from = Some(attempt);
        self
    }

    pub fn succeeding() -> Self {
        Self::new(|attempt| Ok(format!("row {attempt}")))
    }

    pub fn failing(err: impl Fn() -> QueryError + Send + 'static) -> Self {
        Self::new(move |_| Err(err()))
    }
}

#[async_trait]
impl Session for FakeSession {
    type Rows = String;

    async fn execute(&mut self, _query: &str, _args: &[QueryArg]) -> Result<String, QueryError> {
        self.attempts += 1;
        if self.hang_from.is_some_and(|from| self.attempts >= from) {
            std::future::pending::<()>().await;
        }
        (self.respond)(self.attempts)
    }
}

pub(crate) fn missing_relation(schema: Option<&str>, relation: &str) -> QueryError {
    let target = match schema {
        Some(schema) => format!("{schema}.{relation}"),
        None => relation.to_string(),
    };
    QueryError::database(UNDEFINED_TABLE, format!(r#"relation "{target}" does not exist"#))
}

pub(crate) fn syntax_error() -> QueryError {
    QueryError::database("42601", r#"syntax error at or near "selec""#)
}

/// Ready for `secs` seconds.
pub(crate) fn ready_since(name: &str, secs: i64) -> ConnectionState {
    ConnectionState::new(
        name,
        ConnectionStatus::Ready,
        Utc::now() - ChronoDuration::seconds(secs),
    )
}

/// Ready long enough to be trusted.
pub(crate) fn ready(name: &str) -> ConnectionState {
    ready_since(name, 3600)
}

pub(crate) fn loading(name: &str) -> ConnectionState {
    ConnectionState::new(name, ConnectionStatus::Loading, Utc::now())
}

type Snapshot = Box<dyn FnMut(usize) -> Result<ConnectionStateMap, StateError> + Send>;
type WaitResult = Box<dyn Fn() -> Result<(), StateError> + Send + Sync>;

/// State source with scripted snapshots.
///
/// Plain loads are numbered from 1 and handed to the script; search path
/// waits are recorded and succeed unless a wait error is configured.
pub(crate) struct FakeStateSource {
    snapshot: Mutex<Snapshot>,
    wait_error: Option<WaitResult>,
    hang: bool,
    loads: AtomicUsize,
    waits: Mutex<Vec<Vec<String>>>,
    journal: Journal,
}

impl FakeStateSource {
    pub fn scripted(
        snapshot: impl FnMut(usize) -> Result<ConnectionStateMap, StateError> + Send + 'static,
    ) -> Self {
        Self {
            snapshot: Mutex::new(Box::new(snapshot)),
            wait_error: None,
            hang: false,
            loads: AtomicUsize::new(0),
            waits: Mutex::new(Vec::new()),
            journal: Journal::default(),
        }
    }

    pub fn fixed(map: ConnectionStateMap) -> Self {
        Self::scripted(move |_| Ok(map.clone()))
    }

    /// Every load blocks until cancelled.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::fixed(ConnectionStateMap::new())
        }
    }

    pub fn with_wait_error(mut self, err: impl Fn() -> StateError + Send + Sync + 'static) -> Self {
        self.wait_error = Some(Box::new(move || Err(err())));
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> Vec<Vec<String>> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionStateSource<FakeSession> for FakeStateSource {
    async fn load_snapshot(
        &self,
        _conn: &mut FakeSession,
        mode: WaitMode,
    ) -> Result<ConnectionStateMap, StateError> {
        if self.hang {
            std::future::pending::<()>().await;
        }

        if let WaitMode::ForSearchPath(path) = mode {
            self.journal.note("wait");
            self.waits.lock().unwrap().push(path);
            return match &self.wait_error {
                Some(err) => err().map(|_| ConnectionStateMap::new()),
                None => Ok(ConnectionStateMap::new()),
            };
        }

        self.journal.note("load");
        let load = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        let mut snapshot = self.snapshot.lock().unwrap();
        (*snapshot)(load)
    }
}

/// Search path manager with a fixed required path.
pub(crate) struct FakeSearchPath {
    path: Vec<String>,
    fail_refresh: bool,
    refreshes: AtomicUsize,
    recomputes: AtomicUsize,
    applied: AtomicUsize,
    journal: Journal,
}

impl FakeSearchPath {
    pub fn new(path: &[&str]) -> Self {
        Self {
            path: path.iter().map(|s| s.to_string()).collect(),
            fail_refresh: false,
            refreshes: AtomicUsize::new(0),
            recomputes: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
            journal: Journal::default(),
        }
    }

    pub fn failing_refresh(mut self) -> Self {
        self.fail_refresh = true;
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn recomputes(&self) -> usize {
        self.recomputes.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchPathManager<FakeSession> for FakeSearchPath {
    async fn refresh_search_path(&self, _conn: &mut FakeSession) -> Result<(), StateError> {
        self.journal.note("refresh");
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh {
            return Err(StateError::WaitTimeout(std::time::Duration::from_secs(1)));
        }
        Ok(())
    }

    fn recompute_required_search_path(&self) {
        self.journal.note("recompute");
        self.recomputes.fetch_add(1, Ordering::SeqCst);
    }

    fn required_search_path(&self) -> Vec<String> {
        self.path.clone()
    }

    async fn ensure_session_search_path(&self, _conn: &mut FakeSession) -> Result<(), StateError> {
        self.journal.note("apply");
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects every status message.
#[derive(Default)]
pub(crate) struct RecordingStatus {
    messages: Mutex<Vec<String>>,
}

impl RecordingStatus {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingStatus {
    fn set_status(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
