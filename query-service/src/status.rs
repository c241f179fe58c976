//! Progress reporting.
//!
//! Status updates are best effort: a sink must never block the caller and
//! has no way to report failure.

use tokio::sync::watch;

/// Receives human-readable progress messages.
pub trait StatusSink: Send + Sync {
    fn set_status(&self, message: &str);
}

/// Logs messages through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn set_status(&self, message: &str) {
        tracing::info!(status = message, "Query status");
    }
}

/// Publishes the latest message on a watch channel.
#[derive(Debug)]
pub struct WatchStatus {
    tx: watch::Sender<String>,
}

impl WatchStatus {
    pub fn new() -> (Self, watch::Receiver<String>) {
        let (tx, rx) = watch::channel(String::new());
        (Self { tx }, rx)
    }
}

impl StatusSink for WatchStatus {
    fn set_status(&self, message: &str) {
        // no receivers left is fine
        self.tx.send_replace(message.to_string());
    }
}
