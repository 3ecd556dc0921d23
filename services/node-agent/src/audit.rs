//! Job notifications written to the notifications index.
//!
//! Notifications raised before the index templates are installed are held
//! in a bounded buffer and written once the templates are ready, so they
//! are never indexed with dynamic mappings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mlnode_templates::NOTIFICATIONS_INDEX;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::storage::ResultsWriter;

/// Notifications held while templates are not ready.
pub const MAX_PENDING_NOTIFICATIONS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

/// A notification document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMessage {
    pub job_id: String,
    pub message: String,
    pub level: AuditLevel,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
}

pub struct Auditor {
    writer: Arc<dyn ResultsWriter>,
    node_name: String,
    templates_ready: watch::Receiver<bool>,
    pending: Mutex<VecDeque<AuditMessage>>,
    dropped: AtomicU64,
}

impl Auditor {
    pub fn new(
        writer: Arc<dyn ResultsWriter>,
        node_name: impl Into<String>,
        templates_ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            writer,
            node_name: node_name.into(),
            templates_ready,
            pending: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn info(&self, job_id: &str, message: impl Into<String>) {
        self.audit(AuditLevel::Info, job_id, message.into()).await;
    }

    pub async fn warning(&self, job_id: &str, message: impl Into<String>) {
        self.audit(AuditLevel::Warning, job_id, message.into()).await;
    }

    pub async fn error(&self, job_id: &str, message: impl Into<String>) {
        self.audit(AuditLevel::Error, job_id, message.into()).await;
    }

    async fn audit(&self, level: AuditLevel, job_id: &str, message: String) {
        let notification = AuditMessage {
            job_id: job_id.to_string(),
            message,
            level,
            timestamp: Utc::now(),
            node_name: self.node_name.clone(),
        };

        if !*self.templates_ready.borrow() {
            self.hold(notification);
            return;
        }

        self.flush_pending().await;
        self.write(notification).await;
    }

    fn hold(&self, notification: AuditMessage) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if pending.len() >= MAX_PENDING_NOTIFICATIONS {
            pending.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(dropped, "Notification buffer full, dropping oldest notification");
        }
        pending.push_back(notification);
    }

    async fn write(&self, notification: AuditMessage) {
        let job_id = notification.job_id.clone();
        let document = match serde_json::to_value(&notification) {
            Ok(document) => document,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to serialize notification");
                return;
            }
        };
        if let Err(e) = self.writer.write(NOTIFICATIONS_INDEX, document).await {
            warn!(job_id = %job_id, error = %e, "Failed to write notification");
        }
    }

    /// Write out held notifications. Returns how many were written.
    pub async fn flush_pending(&self) -> usize {
        let held: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.drain(..).collect()
        };
        let count = held.len();
        for notification in held {
            self.write(notification).await;
        }
        if count > 0 {
            debug!(count, "Flushed held notifications");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Notifications discarded because the buffer overflowed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Flush held notifications as soon as templates become ready.
    #[instrument(skip_all)]
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ready = self.templates_ready.clone();
        loop {
            if *ready.borrow_and_update() {
                let flushed = self.flush_pending().await;
                if flushed > 0 {
                    info!(flushed, "Templates ready, held notifications written");
                }
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Notification flusher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryResultsWriter;

    fn auditor(ready: bool) -> (Arc<Auditor>, Arc<InMemoryResultsWriter>, watch::Sender<bool>) {
        let writer = Arc::new(InMemoryResultsWriter::new());
        let (tx, rx) = watch::channel(ready);
        let auditor = Arc::new(Auditor::new(writer.clone(), "node-1", rx));
        (auditor, writer, tx)
    }

    #[tokio::test]
    async fn test_writes_when_ready() {
        let (auditor, writer, _tx) = auditor(true);
        auditor.info("farequote", "Opening job").await;

        let docs = writer.documents(NOTIFICATIONS_INDEX);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["level"], "info");
        assert_eq!(docs[0]["job_id"], "farequote");
        assert_eq!(docs[0]["node_name"], "node-1");
    }

    #[tokio::test]
    async fn test_holds_until_ready() {
        let (auditor, writer, tx) = auditor(false);
        auditor.warning("farequote", "first").await;
        auditor.error("farequote", "second").await;

        assert!(writer.documents(NOTIFICATIONS_INDEX).is_empty());
        assert_eq!(auditor.pending_count(), 2);

        tx.send(true).unwrap();
        auditor.info("farequote", "third").await;

        let messages: Vec<_> = writer
            .documents(NOTIFICATIONS_INDEX)
            .iter()
            .map(|d| d["message"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(auditor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let (auditor, _writer, _tx) = auditor(false);
        for i in 0..MAX_PENDING_NOTIFICATIONS + 5 {
            auditor.info("farequote", format!("message {i}")).await;
        }
        assert_eq!(auditor.pending_count(), MAX_PENDING_NOTIFICATIONS);
        assert_eq!(auditor.dropped_count(), 5);
    }

    #[tokio::test]
    async fn test_flusher_writes_on_readiness() {
        let (auditor, writer, tx) = auditor(false);
        auditor.info("farequote", "held").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(auditor.clone().run_flusher(shutdown_rx));

        tx.send(true).unwrap();
        for _ in 0..50 {
            if !writer.documents(NOTIFICATIONS_INDEX).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(writer.documents(NOTIFICATIONS_INDEX).len(), 1);

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
    }
}
