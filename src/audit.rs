//! Best-effort audit trail.
//!
//! [`AuditSink::record`] hands an event to a background writer and returns
//! immediately. Write failures are logged there and never reach the caller,
//! so an audit outage cannot fail a release transition. The same worker
//! purges entries older than the retention window.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::Database;
use crate::models::AuditEvent;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A failed audit write. Only ever logged.
#[derive(Debug, Error)]
#[error("audit write failed for {action} on {target_id}: {reason}")]
pub struct AuditWriteFailure {
    pub action: String,
    pub target_id: Uuid,
    pub reason: String,
}

enum Command {
    Record(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background audit writer. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(event) => f.debug_tuple("Record").field(event).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl AuditSink {
    /// Start the writer on the current tokio runtime.
    ///
    /// The worker stops once every `AuditSink` clone has been dropped.
    pub fn spawn(db: Database, retention: chrono::Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(db, rx, retention));
        (Self { tx }, handle)
    }

    /// Queue an event for writing. Never blocks and never fails.
    pub fn record(&self, event: AuditEvent) {
        if let Err(mpsc::error::SendError(Command::Record(event))) =
            self.tx.send(Command::Record(event))
        {
            let failure = AuditWriteFailure {
                action: event.action,
                target_id: event.target_id,
                reason: "audit writer has stopped".to_string(),
            };
            tracing::warn!("{}", failure);
        }
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run_writer(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<Command>,
    retention: chrono::Duration,
) {
    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Record(event)) => write_event(&db, &event),
                Some(Command::Flush(ack)) => {
                    let _ = ack.send(());
                }
                None => break,
            },
            _ = purge.tick() => {
                if let Err(e) = purge_expired(&db, retention) {
                    tracing::warn!("Audit retention purge failed: {:#}", e);
                }
            }
        }
    }

    tracing::debug!("Audit writer stopped");
}

fn write_event(db: &Database, event: &AuditEvent) {
    match db.insert_audit_entry(event) {
        Ok(entry) => tracing::debug!(
            audit_id = %entry.id,
            actor = %entry.actor_id,
            action = %entry.action,
            "Audit entry written"
        ),
        Err(e) => {
            let failure = AuditWriteFailure {
                action: event.action.clone(),
                target_id: event.target_id,
                reason: format!("{:#}", e),
            };
            tracing::warn!("{}", failure);
        }
    }
}

/// Delete audit entries older than `retention`. Returns how many were removed.
pub fn purge_expired(db: &Database, retention: chrono::Duration) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - retention;
    let removed = db.purge_audit_before(cutoff)?;
    if removed > 0 {
        tracing::info!(removed, cutoff = %cutoff, "Purged expired audit entries");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditQuery;

    fn migrated() -> Database {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[tokio::test]
    async fn recorded_events_are_written_after_flush() {
        let db = migrated();
        let (sink, _worker) = AuditSink::spawn(db.clone(), chrono::Duration::days(90));
        let target = Uuid::new_v4();

        sink.record(AuditEvent::version(
            "alice",
            "submit",
            target,
            Some("draft".into()),
            Some("uploaded".into()),
        ));
        sink.flush().await;

        let entries = db
            .query_audit(&AuditQuery {
                target_id: Some(target),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_id, "alice");
        assert_eq!(entries[0].after_status.as_deref(), Some("uploaded"));
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        // No migrations: every insert fails.
        let db = Database::open_memory().unwrap();
        let (sink, _worker) = AuditSink::spawn(db, chrono::Duration::days(90));

        sink.record(AuditEvent::game("alice", "disable", Uuid::new_v4()));
        sink.flush().await;
    }

    #[tokio::test]
    async fn record_after_writer_stopped_does_not_panic() {
        let db = migrated();
        let (sink, worker) = AuditSink::spawn(db, chrono::Duration::days(90));
        worker.abort();
        let _ = worker.await;

        sink.record(AuditEvent::game("alice", "reset", Uuid::new_v4()));
        sink.flush().await;
    }

    #[test]
    fn purge_removes_only_entries_outside_retention() {
        let db = migrated();
        let target = Uuid::new_v4();

        let mut old = AuditEvent::game("alice", "disable", target);
        old.occurred_at = Utc::now() - chrono::Duration::days(120);
        db.insert_audit_entry(&old).unwrap();
        db.insert_audit_entry(&AuditEvent::game("alice", "enable", target))
            .unwrap();

        let removed = purge_expired(&db, chrono::Duration::days(90)).unwrap();
        assert_eq!(removed, 1);

        let remaining = db.query_audit(&AuditQuery::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, "enable");
    }
}
