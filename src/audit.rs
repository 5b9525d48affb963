use tokio::sync::broadcast;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    BookingCreated,
    BookingCancelled,
    BookingWaitlisted,
    BookingPromoted,
    BookingApproved,
    WaitlistWithdrawn,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::BookingCreated => "BOOKING_CREATED",
            AuditAction::BookingCancelled => "BOOKING_CANCELLED",
            AuditAction::BookingWaitlisted => "BOOKING_WAITLISTED",
            AuditAction::BookingPromoted => "BOOKING_PROMOTED",
            AuditAction::BookingApproved => "BOOKING_APPROVED",
            AuditAction::WaitlistWithdrawn => "WAITLIST_WITHDRAWN",
        }
    }
}

/// Append-only description of something that happened. Holds copies, never
/// references back into the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub principal: Option<String>,
    pub action: AuditAction,
    pub details: String,
    pub at: Ms,
}

/// Receives audit records after the ledger committed the change they describe.
/// Must not fail: a lost audit record never rolls back a booking.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Logs every record under the `audit` tracing target and fans it out to
/// subscribers (notification senders, tests).
pub struct AuditHub {
    sender: broadcast::Sender<AuditRecord>,
}

impl Default for AuditHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }
}

impl AuditSink for AuditHub {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            action = record.action.as_str(),
            principal = record.principal.as_deref().unwrap_or("-"),
            at = record.at,
            "{}",
            record.details
        );
        metrics::counter!(crate::observability::AUDIT_RECORDS_TOTAL, "action" => record.action.as_str())
            .increment(1);
        // No subscribers is fine.
        let _ = self.sender.send(record);
    }
}
