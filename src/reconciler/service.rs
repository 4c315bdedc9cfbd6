//! Event reconciler.
//!
//! Per event: `received -> matched -> applied`, `received -> unresolved -> parked`
//! or `received -> duplicate-skipped`. Nothing is ever dropped: an event whose
//! customer cannot be matched, or whose match failed upstream, is stored
//! verbatim until a manual or batch match replays it.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::applier::EventApplier;
use super::event::BillingEvent;
use super::idempotency::{AppliedEvent, AppliedResult};
use super::plans::PlanCatalogue;
use crate::audit::{AuditLogger, ReconcileAuditEvent, TracingAuditLogger};
use crate::error::Result;
use crate::identity::{IdentityMatcher, IdentityStore, ParkedEvent, ParkedStatus, Resolution};
use crate::ledger::LedgerStore;

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The ledger effect was applied by this call.
    Applied {
        user_id: String,
        result: AppliedResult,
    },
    /// The event key was applied before; this is the recorded result.
    DuplicateSkipped { previous: AppliedEvent },
    /// The customer is unresolved; the event waits for a match.
    Parked { external_ref: String, reason: String },
    /// The event type has no ledger effect.
    Ignored,
}

/// Routes billing events through the matcher and into the ledger.
pub struct EventReconciler<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    matcher: IdentityMatcher<I>,
    applier: Arc<EventApplier<L, I>>,
    plans: PlanCatalogue,
    audit: Arc<dyn AuditLogger>,
}

impl<L, I> EventReconciler<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    /// Create a reconciler. The matcher is wired to replay parked events
    /// through `applier` whenever it links a reference.
    #[must_use]
    pub fn new(matcher: IdentityMatcher<I>, applier: Arc<EventApplier<L, I>>) -> Self {
        let matcher = matcher.with_replay(applier.clone());
        Self {
            matcher,
            applier,
            plans: PlanCatalogue::default(),
            audit: Arc::new(TracingAuditLogger),
        }
    }

    #[must_use]
    pub fn with_plans(mut self, plans: PlanCatalogue) -> Self {
        self.plans = plans;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// The matcher, wired for replay. Admin commands go through this one.
    #[must_use]
    pub fn matcher(&self) -> &IdentityMatcher<I> {
        &self.matcher
    }

    #[must_use]
    pub fn applier(&self) -> &Arc<EventApplier<L, I>> {
        &self.applier
    }

    /// Parse and handle a verified processor event envelope.
    pub async fn handle_webhook(&self, envelope: &Value) -> Result<ReconcileOutcome> {
        match BillingEvent::from_webhook(envelope, &self.plans)? {
            Some(event) => self.handle(event).await,
            None => Ok(ReconcileOutcome::Ignored),
        }
    }

    /// Handle one billing event.
    pub async fn handle(&self, event: BillingEvent) -> Result<ReconcileOutcome> {
        event.validate()?;

        // Redelivery is a pure lookup.
        if let Some(previous) = self.applier.applied_events().get(&event.event_key).await? {
            return Ok(self.duplicate(previous).await);
        }

        // Events for one reference are handled in arrival order, behind any replay.
        let _order = self.matcher.lock_reference(&event.external_ref).await;
        let resolution = match self
            .matcher
            .resolve_in_order(&event.external_ref, &event.match_hints())
            .await
        {
            Ok(resolution) => resolution,
            Err(e) if e.is_upstream() => {
                return self.park(&event, "upstream_unavailable").await;
            }
            Err(e) => return Err(e),
        };

        match resolution {
            Resolution::Matched(matched) => self.apply(&event, &matched.user_id).await,
            Resolution::Unresolved { reason } => self.park(&event, reason.code()).await,
        }
    }

    async fn apply(&self, event: &BillingEvent, user_id: &str) -> Result<ReconcileOutcome> {
        let (record, fresh) = self.applier.apply(event, user_id).await?;
        if fresh {
            Ok(ReconcileOutcome::Applied {
                user_id: user_id.to_string(),
                result: record.result,
            })
        } else {
            Ok(self.duplicate(record).await)
        }
    }

    async fn duplicate(&self, previous: AppliedEvent) -> ReconcileOutcome {
        info!(
            target: "ledgerlink::reconciler",
            event_key = %previous.event_key,
            "Duplicate event skipped"
        );
        self.audit
            .log(ReconcileAuditEvent::EventDuplicateSkipped {
                event_key: previous.event_key.clone(),
            })
            .await;
        ReconcileOutcome::DuplicateSkipped { previous }
    }

    async fn park(&self, event: &BillingEvent, reason: &str) -> Result<ReconcileOutcome> {
        let identity = self.matcher.store();
        let parked = ParkedEvent {
            event_key: event.event_key.clone(),
            external_ref: event.external_ref.clone(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_value(event)?,
            status: ParkedStatus::Parked,
            reason: reason.to_string(),
            parked_at: Utc::now(),
            replayed_at: None,
        };

        if identity.park_event(&parked).await? {
            warn!(
                target: "ledgerlink::reconciler",
                event_key = %event.event_key,
                external_ref = %event.external_ref,
                reason = reason,
                "Event parked"
            );
            self.audit
                .log(ReconcileAuditEvent::EventParked {
                    event_key: event.event_key.clone(),
                    external_ref: event.external_ref.clone(),
                })
                .await;
        }

        // A match may have landed between our resolve and the park; its replay
        // would have missed this event.
        if let Some(link) = identity.find_link_by_ref(&event.external_ref).await? {
            return self.apply(event, &link.user_id).await;
        }

        Ok(ReconcileOutcome::Parked {
            external_ref: event.external_ref.clone(),
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditLogger;
    use crate::identity::{InMemoryCustomerDirectory, ProcessorCustomer};
    use crate::ledger::CreditLedger;
    use crate::reconciler::EventKind;
    use crate::retry::RetryPolicy;
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        customers: InMemoryCustomerDirectory,
        audit: RecordingAuditLogger,
        reconciler: EventReconciler<InMemoryStore, InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.add_user("user_1", Some("one@example.com"), Some("Jane Doe"));
        let customers = InMemoryCustomerDirectory::new();
        let audit = RecordingAuditLogger::new();

        let matcher = IdentityMatcher::new(
            store.clone(),
            store.clone(),
            Arc::new(customers.clone()),
        )
        .with_retry_policy(RetryPolicy::none());
        let applier = Arc::new(EventApplier::new(
            CreditLedger::new(store.clone()),
            store.clone(),
            store.clone(),
        ));
        let reconciler =
            EventReconciler::new(matcher, applier).with_audit_logger(Arc::new(audit.clone()));

        Fixture {
            store,
            customers,
            audit,
            reconciler,
        }
    }

    fn activation(event_key: &str, external_ref: &str) -> BillingEvent {
        let now = Utc::now();
        BillingEvent::new(
            event_key,
            external_ref,
            EventKind::SubscriptionActivated {
                subscription_ref: format!("sub_{}", external_ref),
                credits: 100,
                period_start: now,
                period_end: now + Duration::days(30),
                price_ref: None,
            },
        )
    }

    #[tokio::test]
    async fn test_matched_event_is_applied() {
        let f = fixture();
        f.customers
            .insert(ProcessorCustomer::new("cus_1").with_email("one@example.com"));

        let outcome = f.reconciler.handle(activation("evt_1", "cus_1")).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied { ref user_id, .. } if user_id == "user_1"
        ));
        assert_eq!(f.store.get_balance("user_1").await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_redelivery_returns_recorded_result() {
        let f = fixture();
        f.customers
            .insert(ProcessorCustomer::new("cus_1").with_email("one@example.com"));

        let first = f.reconciler.handle(activation("evt_1", "cus_1")).await.unwrap();
        let ReconcileOutcome::Applied { result, .. } = first else {
            panic!("expected applied");
        };

        for _ in 0..3 {
            let again = f.reconciler.handle(activation("evt_1", "cus_1")).await.unwrap();
            match again {
                ReconcileOutcome::DuplicateSkipped { previous } => assert_eq!(previous.result, result),
                other => panic!("expected duplicate, got {:?}", other),
            }
        }

        assert_eq!(f.store.list_transactions("user_1").await.unwrap().len(), 1);
        assert_eq!(
            f.audit.events_of_kind("event_duplicate_skipped").await.len(),
            3
        );
    }

    #[tokio::test]
    async fn test_unmatched_event_is_parked_once() {
        let f = fixture();

        for _ in 0..2 {
            let outcome = f.reconciler.handle(activation("evt_1", "cus_ghost")).await.unwrap();
            assert_eq!(
                outcome,
                ReconcileOutcome::Parked {
                    external_ref: "cus_ghost".to_string(),
                    reason: "no_candidate".to_string(),
                }
            );
        }

        assert_eq!(f.store.list_parked("cus_ghost").await.unwrap().len(), 1);
        assert_eq!(f.audit.events_of_kind("event_parked").await.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_outage_parks_event() {
        let f = fixture();
        f.customers
            .insert(ProcessorCustomer::new("cus_1").with_email("one@example.com"));
        f.customers.fail_next(1);

        let outcome = f.reconciler.handle(activation("evt_1", "cus_1")).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Parked {
                external_ref: "cus_1".to_string(),
                reason: "upstream_unavailable".to_string(),
            }
        );

        // Batch match after recovery replays the parked event.
        let report = f.reconciler.matcher().batch_resolve(&["cus_1".to_string()]).await;
        assert_eq!(report.matched, 1);
        assert_eq!(f.store.get_balance("user_1").await.unwrap().unwrap().balance, 100);
        assert!(f.store.list_parked("cus_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ignored_webhook() {
        let f = fixture();
        let envelope = serde_json::json!({
            "id": "evt_x",
            "type": "charge.succeeded",
            "data": { "object": { "id": "ch_1" } }
        });
        assert_eq!(
            f.reconciler.handle_webhook(&envelope).await.unwrap(),
            ReconcileOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let f = fixture();
        let err = f.reconciler.handle(activation("", "cus_1")).await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_zero_credit_invoice_is_rejected_before_parking() {
        let f = fixture();
        let event = BillingEvent::new(
            "evt_zero",
            "cus_ghost",
            EventKind::InvoicePaid {
                invoice_ref: "in_zero".to_string(),
                subscription_ref: None,
                credits: 0,
                period_start: None,
                period_end: None,
            },
        );

        let err = f.reconciler.handle(event).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(f.store.list_parked("cus_ghost").await.unwrap().is_empty());
        assert!(f.store.get_unresolved("cus_ghost").await.unwrap().is_none());
        assert_eq!(f.customers.calls(), 0);
    }
}
