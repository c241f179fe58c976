//! Connection loading state.
//!
//! Each logical connection is backed by a schema that a background loader
//! populates. The loaders publish their progress; these types are the
//! read-only view of it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Loading status of a connection's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Known but the loader has not started.
    Pending,
    /// Loader is importing the schema.
    Loading,
    /// Schema is fully populated.
    Ready,
    /// Loader gave up; see the state's error detail.
    Error,
    /// Connection is configured but switched off.
    Disabled,
}

impl ConnectionStatus {
    /// True for states the loader will not leave on its own.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Ready | ConnectionStatus::Error | ConnectionStatus::Disabled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Loading => "loading",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string is not one of the known states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connection status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ConnectionStatus::Pending),
            "loading" => Ok(ConnectionStatus::Loading),
            "ready" => Ok(ConnectionStatus::Ready),
            "error" => Ok(ConnectionStatus::Error),
            "disabled" => Ok(ConnectionStatus::Disabled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// State of a single connection.
///
/// `error` is set exactly when `status` is [`ConnectionStatus::Error`]; use
/// [`ConnectionState::new`] and [`ConnectionState::failed`] to keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionState {
    /// Connection name, which is also its schema name.
    pub name: String,
    pub status: ConnectionStatus,
    /// Time of the last status transition.
    pub last_modified: DateTime<Utc>,
    /// Loader failure, only for `error` connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionState {
    /// Creates a state without error detail.
    ///
    /// An `Error` status gets a generic detail so the invariant holds.
    pub fn new(
        name: impl Into<String>,
        status: ConnectionStatus,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let error = (status == ConnectionStatus::Error).then(|| "unknown error".to_string());
        Self {
            name: name.into(),
            status,
            last_modified,
            error,
        }
    }

    /// Creates an `error` state carrying the loader's failure.
    pub fn failed(
        name: impl Into<String>,
        detail: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            status: ConnectionStatus::Error,
            last_modified,
            error: Some(detail.into()),
        }
    }

    /// Loader failure detail, if the connection is in error.
    pub fn error_detail(&self) -> Option<&str> {
        match self.status {
            ConnectionStatus::Error => self.error.as_deref(),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }

    /// True when the last transition happened more than `threshold` before `now`.
    pub fn is_stable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        older_than(self.last_modified, now, threshold)
    }
}

/// Point-in-time snapshot of every connection's state, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionStateMap {
    states: BTreeMap<String, ConnectionState>,
}

impl ConnectionStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the state for `state.name`.
    pub fn insert(&mut self, state: ConnectionState) {
        self.states.insert(state.name.clone(), state);
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionState> {
        self.states.get(name)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// States in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionState> {
        self.states.values()
    }

    /// True when every connection is ready.
    pub fn all_ready(&self) -> bool {
        self.iter().all(ConnectionState::is_ready)
    }

    /// True when no connection is still pending or loading.
    pub fn all_loaded(&self) -> bool {
        self.iter().all(|s| s.status.is_loaded())
    }

    pub fn pending_count(&self) -> usize {
        self.iter()
            .filter(|s| s.status == ConnectionStatus::Pending)
            .count()
    }

    pub fn loaded_count(&self) -> usize {
        self.iter().filter(|s| s.status.is_loaded()).count()
    }

    /// Latest status transition across all connections.
    pub fn most_recent_modification(&self) -> Option<DateTime<Utc>> {
        self.iter().map(|s| s.last_modified).max()
    }

    /// True when nothing has transitioned within `threshold` of `now`.
    ///
    /// An empty map is stable.
    pub fn is_stable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.most_recent_modification()
            .map_or(true, |t| older_than(t, now, threshold))
    }

    /// Progress text shown while a query waits on `schema`.
    pub fn loading_status_message(&self, schema: &str) -> String {
        let loaded = self.loaded_count();
        let total = self.len();
        match self.get(schema).map(|s| s.status) {
            Some(ConnectionStatus::Pending) => format!(
                "Waiting for connection '{schema}' to start loading ({loaded} of {total} loaded)..."
            ),
            Some(_) => format!(
                "Waiting for connection '{schema}' to finish loading ({loaded} of {total} loaded)..."
            ),
            None => self.progress_message(),
        }
    }

    /// Progress text when no single connection is being waited on.
    pub fn progress_message(&self) -> String {
        format!(
            "Loading connections ({} of {} loaded)...",
            self.loaded_count(),
            self.len()
        )
    }
}

impl FromIterator<ConnectionState> for ConnectionStateMap {
    fn from_iter<I: IntoIterator<Item = ConnectionState>>(iter: I) -> Self {
        let mut map = Self::new();
        for state in iter {
            map.insert(state);
        }
        map
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match (now - at).to_std() {
        Ok(age) => age > threshold,
        // `at` lies in the future
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn ago(secs: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            ConnectionStatus::Pending,
            ConnectionStatus::Loading,
            ConnectionStatus::Ready,
            ConnectionStatus::Error,
            ConnectionStatus::Disabled,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>(), Ok(status));
        }
        assert_eq!("READY".parse::<ConnectionStatus>(), Ok(ConnectionStatus::Ready));
        assert!("updating".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn test_error_detail_only_for_error_status() {
        let failed = ConnectionState::failed("aws", "plugin crashed", Utc::now());
        assert_eq!(failed.error_detail(), Some("plugin crashed"));

        let mut ready = ConnectionState::new("gcp", ConnectionStatus::Ready, Utc::now());
        assert!(ready.error.is_none());
        ready.error = Some("stale".into());
        assert_eq!(ready.error_detail(), None);

        let bare = ConnectionState::new("azure", ConnectionStatus::Error, Utc::now());
        assert!(bare.error_detail().is_some());
    }

    #[test]
    fn test_all_ready_and_all_loaded() {
        let mut map: ConnectionStateMap = [
            ConnectionState::new("aws", ConnectionStatus::Ready, ago(10)),
            ConnectionState::new("gcp", ConnectionStatus::Disabled, ago(10)),
        ]
        .into_iter()
        .collect();
        assert!(!map.all_ready());
        assert!(map.all_loaded());

        map.insert(ConnectionState::new("gcp", ConnectionStatus::Ready, ago(5)));
        assert!(map.all_ready());

        map.insert(ConnectionState::new("azure", ConnectionStatus::Loading, ago(1)));
        assert!(!map.all_ready());
        assert!(!map.all_loaded());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_most_recent_modification() {
        let newest = ago(1);
        let map: ConnectionStateMap = [
            ConnectionState::new("aws", ConnectionStatus::Ready, ago(30)),
            ConnectionState::new("gcp", ConnectionStatus::Ready, newest),
        ]
        .into_iter()
        .collect();
        assert_eq!(map.most_recent_modification(), Some(newest));
        assert_eq!(ConnectionStateMap::new().most_recent_modification(), None);
    }

    #[test]
    fn test_stability_threshold() {
        let threshold = Duration::from_millis(250);
        let now = Utc::now();
        let settled = ConnectionState::new("aws", ConnectionStatus::Ready, now - ChronoDuration::seconds(1));
        let fresh = ConnectionState::new("gcp", ConnectionStatus::Ready, now);
        assert!(settled.is_stable(now, threshold));
        assert!(!fresh.is_stable(now, threshold));

        let map: ConnectionStateMap = [settled, fresh].into_iter().collect();
        assert!(!map.is_stable(now, threshold));
        assert!(ConnectionStateMap::new().is_stable(now, threshold));
    }

    #[test]
    fn test_loading_status_message() {
        let map: ConnectionStateMap = [
            ConnectionState::new("aws", ConnectionStatus::Loading, ago(1)),
            ConnectionState::new("gcp", ConnectionStatus::Ready, ago(1)),
            ConnectionState::new("azure", ConnectionStatus::Pending, ago(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            map.loading_status_message("aws"),
            "Waiting for connection 'aws' to finish loading (1 of 3 loaded)..."
        );
        assert!(map.loading_status_message("azure").contains("to start loading"));
        assert_eq!(map.loading_status_message("public"), map.progress_message());
        assert_eq!(map.progress_message(), "Loading connections (1 of 3 loaded)...");
        assert_eq!(map.pending_count(), 1);
    }

    #[test]
    fn test_serializes_as_object_keyed_by_name() {
        let map: ConnectionStateMap = [ConnectionState::failed("aws", "boom", Utc::now())]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["aws"]["status"], "error");
        assert_eq!(json["aws"]["error"], "boom");
    }
}
