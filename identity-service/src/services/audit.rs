//! Fire-and-forget audit sink.
//!
//! Recording never fails the calling operation: persistence errors are
//! logged and dropped.

use std::sync::{Arc, Mutex};

use crate::models::{AuditEvent, AuditEventType};
use crate::services::store::Database;

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the `audit_events` table on a background task.
#[derive(Clone)]
pub struct DatabaseAuditSink {
    db: Database,
}

impl DatabaseAuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl AuditSink for DatabaseAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            event_type = %event.event_type,
            user_id = ?event.user_id,
            session_id = ?event.session_id,
            ip = ?event.ip_address,
            "Audit event"
        );

        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.insert_audit_event(&event).await {
                tracing::error!(event_id = %event.event_id, error = %e, "Failed to persist audit event");
            }
        });
    }
}

/// Keeps events in memory; used by tests and local runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events().iter().filter(|e| e.is(event_type)).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(e) => tracing::error!("Audit sink mutex poisoned: {}", e),
        }
    }
}
