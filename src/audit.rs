//! Audit logging for identity and ledger operations.
//!
//! Every link change, ledger mutation and reconciler decision is reported as a
//! [`ReconcileAuditEvent`]. The default [`TracingAuditLogger`] writes them to
//! `tracing` under the `ledgerlink::audit` target.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Audit event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAuditEvent {
    /// A customer link was created.
    LinkCreated {
        external_ref: String,
        user_id: String,
        strategy: String,
        confidence: String,
    },
    /// An existing link was re-pointed by an operator.
    LinkRepaired {
        external_ref: String,
        previous_user_id: String,
        user_id: String,
        note: Option<String>,
    },
    /// A reference could not be matched and was queued.
    ReferenceUnresolved {
        external_ref: String,
        reason: String,
    },
    /// An operator gave up on a pending reference.
    ReferenceAbandoned {
        external_ref: String,
        note: Option<String>,
    },
    /// An event was stored for later replay.
    EventParked {
        event_key: String,
        external_ref: String,
    },
    /// An event's ledger effect was applied.
    EventApplied {
        event_key: String,
        user_id: String,
        event_type: String,
    },
    /// A redelivered event was skipped.
    EventDuplicateSkipped { event_key: String },
    /// Credits were consumed.
    CreditsConsumed {
        user_id: String,
        amount: i64,
        balance: i64,
    },
    /// Credits were added (bonus or recharge).
    CreditsAdded {
        user_id: String,
        amount: i64,
        balance: i64,
        kind: String,
    },
    /// A subscription grant was canceled.
    GrantCanceled {
        grant_id: String,
        user_id: String,
    },
    /// A grant lapsed and its remaining credits were removed.
    GrantExpired {
        grant_id: String,
        user_id: String,
        recovered: i64,
    },
    /// A ledger operation completed with a clamped effect.
    ReconciliationWarning { user_id: String, message: String },
}

impl fmt::Display for ReconcileAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkCreated { external_ref, user_id, strategy, confidence } => {
                write!(f, "Link created: ref={}, user={}, strategy={}, confidence={}", external_ref, user_id, strategy, confidence)
            }
            Self::LinkRepaired { external_ref, previous_user_id, user_id, .. } => {
                write!(f, "Link repaired: ref={}, from={}, to={}", external_ref, previous_user_id, user_id)
            }
            Self::ReferenceUnresolved { external_ref, reason } => {
                write!(f, "Reference unresolved: ref={}, reason={}", external_ref, reason)
            }
            Self::ReferenceAbandoned { external_ref, .. } => {
                write!(f, "Reference abandoned: ref={}", external_ref)
            }
            Self::EventParked { event_key, external_ref } => {
                write!(f, "Event parked: event={}, ref={}", event_key, external_ref)
            }
            Self::EventApplied { event_key, user_id, event_type } => {
                write!(f, "Event applied: event={}, user={}, type={}", event_key, user_id, event_type)
            }
            Self::EventDuplicateSkipped { event_key } => {
                write!(f, "Event duplicate skipped: event={}", event_key)
            }
            Self::CreditsConsumed { user_id, amount, balance } => {
                write!(f, "Credits consumed: user={}, amount={}, balance={}", user_id, amount, balance)
            }
            Self::CreditsAdded { user_id, amount, balance, kind } => {
                write!(f, "Credits added: user={}, amount={}, balance={}, kind={}", user_id, amount, balance, kind)
            }
            Self::GrantCanceled { grant_id, user_id } => {
                write!(f, "Grant canceled: grant={}, user={}", grant_id, user_id)
            }
            Self::GrantExpired { grant_id, user_id, recovered } => {
                write!(f, "Grant expired: grant={}, user={}, recovered={}", grant_id, user_id, recovered)
            }
            Self::ReconciliationWarning { user_id, message } => {
                write!(f, "Reconciliation warning: user={}, {}", user_id, message)
            }
        }
    }
}

impl ReconcileAuditEvent {
    /// Event kind as a string for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LinkCreated { .. } => "link_created",
            Self::LinkRepaired { .. } => "link_repaired",
            Self::ReferenceUnresolved { .. } => "reference_unresolved",
            Self::ReferenceAbandoned { .. } => "reference_abandoned",
            Self::EventParked { .. } => "event_parked",
            Self::EventApplied { .. } => "event_applied",
            Self::EventDuplicateSkipped { .. } => "event_duplicate_skipped",
            Self::CreditsConsumed { .. } => "credits_consumed",
            Self::CreditsAdded { .. } => "credits_added",
            Self::GrantCanceled { .. } => "grant_canceled",
            Self::GrantExpired { .. } => "grant_expired",
            Self::ReconciliationWarning { .. } => "reconciliation_warning",
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should swallow their own failures so audit problems never
/// fail a ledger or identity operation.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(&self, event: ReconcileAuditEvent);
}

/// Audit logger that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl AuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: ReconcileAuditEvent) {}
}

/// Logs audit events with `tracing` at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: ReconcileAuditEvent) {
        if matches!(event, ReconcileAuditEvent::ReconciliationWarning { .. }) {
            tracing::warn!(
                target: "ledgerlink::audit",
                event_type = %event.kind(),
                "{}", event
            );
        } else {
            tracing::info!(
                target: "ledgerlink::audit",
                event_type = %event.kind(),
                "{}", event
            );
        }
    }
}

/// Audit logger that keeps every event in memory, for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingAuditLogger {
    events: Arc<Mutex<Vec<ReconcileAuditEvent>>>,
}

impl RecordingAuditLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ReconcileAuditEvent> {
        self.events.lock().await.clone()
    }

    /// Recorded events of one kind, see [`ReconcileAuditEvent::kind`].
    pub async fn events_of_kind(&self, kind: &str) -> Vec<ReconcileAuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditLogger for RecordingAuditLogger {
    async fn log(&self, event: ReconcileAuditEvent) {
        self.events.lock().await.push(event);
    }
}
