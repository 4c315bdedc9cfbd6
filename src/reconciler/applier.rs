//! Applies an event's ledger effect for a known user.
//!
//! Every application is serialized per event key, checked against the
//! applied-event store first and recorded afterwards. Ledger writes also carry
//! dedupe keys, so an effect that landed before a crash is found again instead
//! of being written twice.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::event::{BillingEvent, EventKind};
use super::idempotency::{AppliedEvent, AppliedEventStore, AppliedResult};
use crate::audit::{AuditLogger, ReconcileAuditEvent, TracingAuditLogger};
use crate::error::Result;
use crate::identity::{IdentityStore, PendingReplay, ReplaySummary};
use crate::ledger::{
    CreditLedger, GrantOutcome, GrantWindow, LedgerStore, RechargeRequest,
    SubscriptionGrantRequest,
};
use crate::locks::KeyedLocks;

/// Dedupe key for the recharge of a paid invoice.
#[must_use]
pub fn invoice_dedupe_key(invoice_ref: &str) -> String {
    format!("invoice:{}", invoice_ref)
}

/// Applies billing events to the ledger.
pub struct EventApplier<L: LedgerStore, I: IdentityStore> {
    ledger: CreditLedger<L>,
    identity: Arc<I>,
    applied: Arc<dyn AppliedEventStore>,
    locks: KeyedLocks,
    audit: Arc<dyn AuditLogger>,
}

impl<L: LedgerStore, I: IdentityStore> EventApplier<L, I> {
    #[must_use]
    pub fn new(
        ledger: CreditLedger<L>,
        identity: Arc<I>,
        applied: Arc<dyn AppliedEventStore>,
    ) -> Self {
        Self {
            ledger,
            identity,
            applied,
            locks: KeyedLocks::new(),
            audit: Arc::new(TracingAuditLogger),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn ledger(&self) -> &CreditLedger<L> {
        &self.ledger
    }

    #[must_use]
    pub fn applied_events(&self) -> &Arc<dyn AppliedEventStore> {
        &self.applied
    }

    /// Apply `event` for `user_id` unless its key was already applied.
    ///
    /// Returns the recorded result and whether this call applied it.
    pub async fn apply(&self, event: &BillingEvent, user_id: &str) -> Result<(AppliedEvent, bool)> {
        let _guard = self.locks.lock(&event.event_key).await;

        if let Some(previous) = self.applied.get(&event.event_key).await? {
            debug!(
                target: "ledgerlink::reconciler",
                event_key = %event.event_key,
                "Event already applied"
            );
            // A parked copy may still be waiting if the live delivery won.
            self.identity.mark_parked_replayed(&event.event_key).await?;
            return Ok((previous, false));
        }

        let result = self.apply_effect(event, user_id).await?;
        let record = AppliedEvent::new(&event.event_key, event.event_type(), result);

        if !self.applied.record(record.clone()).await? {
            // Lost a race with another process sharing the store.
            let existing = self.applied.get(&event.event_key).await?.unwrap_or(record);
            return Ok((existing, false));
        }
        self.identity.mark_parked_replayed(&event.event_key).await?;

        info!(
            target: "ledgerlink::reconciler",
            event_key = %event.event_key,
            event_type = event.event_type(),
            user_id = user_id,
            "Event applied"
        );
        self.audit
            .log(ReconcileAuditEvent::EventApplied {
                event_key: event.event_key.clone(),
                user_id: user_id.to_string(),
                event_type: event.event_type().to_string(),
            })
            .await;

        Ok((record, true))
    }

    async fn apply_effect(&self, event: &BillingEvent, user_id: &str) -> Result<AppliedResult> {
        let metadata = serde_json::json!({
            "event_key": event.event_key,
            "external_ref": event.external_ref,
        });

        match &event.kind {
            EventKind::SubscriptionActivated {
                subscription_ref,
                credits,
                period_start,
                period_end,
                price_ref,
            } => {
                let mut metadata = metadata;
                if let Some(price_ref) = price_ref {
                    metadata["price_ref"] = serde_json::Value::String(price_ref.clone());
                }
                let outcome = self
                    .ledger
                    .open_subscription_grant(SubscriptionGrantRequest {
                        user_id: user_id.to_string(),
                        subscription_ref: subscription_ref.clone(),
                        credits: *credits,
                        starts_at: *period_start,
                        ends_at: *period_end,
                        description: format!("Subscription {} credits", subscription_ref),
                        metadata,
                    })
                    .await?;
                Ok(credited(user_id, outcome))
            }
            EventKind::InvoicePaid {
                invoice_ref,
                subscription_ref,
                credits,
                period_start,
                period_end,
            } => {
                let grant = match (subscription_ref, period_start, period_end) {
                    (Some(subscription_ref), Some(starts_at), Some(ends_at)) => Some(GrantWindow {
                        subscription_ref: subscription_ref.clone(),
                        starts_at: *starts_at,
                        ends_at: *ends_at,
                    }),
                    _ => None,
                };
                let outcome = self
                    .ledger
                    .recharge(RechargeRequest {
                        user_id: user_id.to_string(),
                        amount: *credits,
                        description: format!("Invoice {} paid", invoice_ref),
                        metadata,
                        dedupe_key: Some(invoice_dedupe_key(invoice_ref)),
                        grant,
                    })
                    .await?;
                Ok(credited(user_id, outcome))
            }
            EventKind::SubscriptionUpdated {
                subscription_ref,
                status,
            } if EventKind::is_terminal_status(status) => {
                self.cancel(user_id, subscription_ref).await
            }
            EventKind::SubscriptionUpdated { .. } => Ok(AppliedResult::Ignored),
            EventKind::SubscriptionCanceled { subscription_ref } => {
                self.cancel(user_id, subscription_ref).await
            }
        }
    }

    async fn cancel(&self, user_id: &str, subscription_ref: &str) -> Result<AppliedResult> {
        let canceled = self.ledger.cancel_grant(subscription_ref).await?;
        Ok(AppliedResult::GrantsCanceled {
            user_id: user_id.to_string(),
            grant_ids: canceled.into_iter().map(|g| g.id).collect(),
        })
    }
}

fn credited(user_id: &str, outcome: GrantOutcome) -> AppliedResult {
    AppliedResult::Credited {
        user_id: user_id.to_string(),
        transaction_id: outcome.transaction_id,
        added: outcome.added,
        balance: outcome.balance,
    }
}

#[async_trait]
impl<L, I> PendingReplay for EventApplier<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    async fn replay(&self, external_ref: &str, user_id: &str) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for parked in self.identity.list_parked(external_ref).await? {
            let event: BillingEvent = match serde_json::from_value(parked.payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        target: "ledgerlink::reconciler",
                        event_key = %parked.event_key,
                        error = %e,
                        "Parked event payload unreadable"
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            match self.apply(&event, user_id).await {
                Ok((_, true)) => summary.replayed += 1,
                Ok((_, false)) => summary.skipped += 1,
                Err(e) => {
                    warn!(
                        target: "ledgerlink::reconciler",
                        event_key = %parked.event_key,
                        user_id = user_id,
                        error = %e,
                        "Replay of parked event failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.replayed + summary.failed > 0 {
            info!(
                target: "ledgerlink::reconciler",
                external_ref = external_ref,
                user_id = user_id,
                replayed = summary.replayed,
                skipped = summary.skipped,
                failed = summary.failed,
                "Replayed parked events"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ParkedEvent, ParkedStatus};
    use crate::storage::InMemoryStore;
    use chrono::{Duration, Utc};

    fn applier(store: &Arc<InMemoryStore>) -> EventApplier<InMemoryStore, InMemoryStore> {
        EventApplier::new(CreditLedger::new(store.clone()), store.clone(), store.clone())
    }

    fn activation(event_key: &str, credits: i64) -> BillingEvent {
        let now = Utc::now();
        BillingEvent::new(
            event_key,
            "cus_abc",
            EventKind::SubscriptionActivated {
                subscription_ref: "sub_1".to_string(),
                credits,
                period_start: now - Duration::days(1),
                period_end: now + Duration::days(29),
                price_ref: None,
            },
        )
    }

    async fn park(store: &InMemoryStore, event: &BillingEvent) {
        store
            .park_event(&ParkedEvent {
                event_key: event.event_key.clone(),
                external_ref: event.external_ref.clone(),
                event_type: event.event_type().to_string(),
                payload: serde_json::to_value(event).unwrap(),
                status: ParkedStatus::Parked,
                reason: "no_candidate".to_string(),
                parked_at: Utc::now(),
                replayed_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_activation_opens_grant_once() {
        let store = Arc::new(InMemoryStore::new());
        let applier = applier(&store);
        let event = activation("evt_1", 50);

        let (record, fresh) = applier.apply(&event, "user_1").await.unwrap();
        assert!(fresh);
        assert!(matches!(record.result, AppliedResult::Credited { added: 50, .. }));

        let (again, fresh) = applier.apply(&event, "user_1").await.unwrap();
        assert!(!fresh);
        assert_eq!(again, record);

        assert_eq!(store.get_balance("user_1").await.unwrap().unwrap().balance, 50);
        assert_eq!(store.list_grants("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invoice_recharge_dedupes_across_event_keys() {
        let store = Arc::new(InMemoryStore::new());
        let applier = applier(&store);
        let kind = EventKind::InvoicePaid {
            invoice_ref: "in_1".to_string(),
            subscription_ref: None,
            credits: 20,
            period_start: None,
            period_end: None,
        };

        applier
            .apply(&BillingEvent::new("evt_a", "cus_abc", kind.clone()), "user_1")
            .await
            .unwrap();
        // Same invoice under a different event key must not credit twice.
        applier
            .apply(&BillingEvent::new("evt_b", "cus_abc", kind), "user_1")
            .await
            .unwrap();

        let history = store.list_transactions("user_1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].dedupe_key.as_deref(), Some("invoice:in_1"));
    }

    #[tokio::test]
    async fn test_cancellation_keeps_credits() {
        let store = Arc::new(InMemoryStore::new());
        let applier = applier(&store);
        applier.apply(&activation("evt_1", 30), "user_1").await.unwrap();

        let cancel = BillingEvent::new(
            "evt_2",
            "cus_abc",
            EventKind::SubscriptionCanceled {
                subscription_ref: "sub_1".to_string(),
            },
        );
        let (record, _) = applier.apply(&cancel, "user_1").await.unwrap();
        assert!(matches!(
            record.result,
            AppliedResult::GrantsCanceled { ref grant_ids, .. } if grant_ids.len() == 1
        ));
        assert_eq!(store.get_balance("user_1").await.unwrap().unwrap().balance, 30);
    }

    #[tokio::test]
    async fn test_non_terminal_update_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let applier = applier(&store);
        let update = BillingEvent::new(
            "evt_1",
            "cus_abc",
            EventKind::SubscriptionUpdated {
                subscription_ref: "sub_1".to_string(),
                status: "past_due".to_string(),
            },
        );

        let (record, fresh) = applier.apply(&update, "user_1").await.unwrap();
        assert!(fresh);
        assert_eq!(record.result, AppliedResult::Ignored);
        assert!(store.get("evt_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replay_applies_parked_events_once() {
        let store = Arc::new(InMemoryStore::new());
        let applier = applier(&store);
        let event = activation("evt_parked", 40);
        park(&store, &event).await;

        let summary = applier.replay("cus_abc", "user_42").await.unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.failed, 0);
        assert!(store.list_parked("cus_abc").await.unwrap().is_empty());

        let summary = applier.replay("cus_abc", "user_42").await.unwrap();
        assert_eq!(summary, ReplaySummary::default());
        assert_eq!(store.get_balance("user_42").await.unwrap().unwrap().balance, 40);
    }

    #[tokio::test]
    async fn test_replay_counts_unreadable_payloads() {
        let store = Arc::new(InMemoryStore::new());
        store
            .park_event(&ParkedEvent {
                event_key: "evt_bad".to_string(),
                external_ref: "cus_abc".to_string(),
                event_type: "subscription_activated".to_string(),
                payload: serde_json::json!({ "garbage": true }),
                status: ParkedStatus::Parked,
                reason: "no_candidate".to_string(),
                parked_at: Utc::now(),
                replayed_at: None,
            })
            .await
            .unwrap();

        let summary = applier(&store).replay("cus_abc", "user_1").await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(store.list_parked("cus_abc").await.unwrap().len(), 1);
    }
}
