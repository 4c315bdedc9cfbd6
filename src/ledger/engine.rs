//! Credit ledger engine.
//!
//! Every write for a user runs under that user's lock and goes to the store as
//! a single [`LedgerMutation`], so the balance update and its transaction are
//! never observed apart.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::{
    ApplyOutcome, CreditBalance, CreditGrant, CreditTransaction, GrantDraw, GrantEffect,
    GrantStatus, LedgerMutation, LedgerStore, ReconciliationWarning, TransactionKind,
};
use crate::audit::{AuditLogger, ReconcileAuditEvent, TracingAuditLogger};
use crate::error::{LedgerLinkError, Result};
use crate::locks::KeyedLocks;

/// Outcome of [`CreditLedger::consume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Consumed {
        balance: i64,
        consumed: i64,
        transaction_id: String,
    },
    /// Not enough credits. Nothing was written.
    InsufficientBalance { balance: i64, required: i64 },
}

impl ConsumeOutcome {
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        matches!(self, Self::Consumed { .. })
    }

    #[must_use]
    pub fn balance(&self) -> i64 {
        match self {
            Self::Consumed { balance, .. } | Self::InsufficientBalance { balance, .. } => *balance,
        }
    }
}

/// Outcome of a credit-adding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantOutcome {
    pub balance: i64,
    pub added: i64,
    pub transaction_id: String,
    /// The dedupe key matched an earlier transaction; the values above are from it.
    pub duplicate: bool,
}

impl GrantOutcome {
    fn from_transaction(transaction: &CreditTransaction, duplicate: bool) -> Self {
        Self {
            balance: transaction.balance_after,
            added: transaction.amount,
            transaction_id: transaction.id.clone(),
            duplicate,
        }
    }
}

/// Input for [`CreditLedger::grant_bonus`].
#[derive(Debug, Clone, Default)]
pub struct BonusRequest {
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
    pub metadata: serde_json::Value,
    /// Externally meaningful key such as `signup_<user>`; repeats are no-ops.
    pub dedupe_key: Option<String>,
}

impl BonusRequest {
    #[must_use]
    pub fn new(user_id: impl Into<String>, amount: i64, reason: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            dedupe_key: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Validity window for a grant opened alongside a recharge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantWindow {
    pub subscription_ref: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Input for [`CreditLedger::recharge`].
#[derive(Debug, Clone, Default)]
pub struct RechargeRequest {
    pub user_id: String,
    pub amount: i64,
    pub description: String,
    pub metadata: serde_json::Value,
    pub dedupe_key: Option<String>,
    /// Open a time-boxed grant for the recharged credits.
    pub grant: Option<GrantWindow>,
}

/// Input for [`CreditLedger::open_subscription_grant`].
#[derive(Debug, Clone)]
pub struct SubscriptionGrantRequest {
    pub user_id: String,
    pub subscription_ref: String,
    pub credits: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub description: String,
    pub metadata: serde_json::Value,
}

/// Outcome of [`CreditLedger::expire_grants`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySummary {
    pub expired_count: usize,
    pub recovered_credits: i64,
    /// Warnings raised for grants whose deduction had to be clamped.
    pub warnings: usize,
}

/// Drift found by [`CreditLedger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerVerification {
    pub user_id: String,
    pub balance: i64,
    pub total_recharged: i64,
    pub total_consumed: i64,
    pub computed_balance: i64,
    pub transaction_count: usize,
    pub issues: Vec<String>,
}

impl LedgerVerification {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Applies consumption, bonus, recharge and expiry against a [`LedgerStore`].
pub struct CreditLedger<S: LedgerStore> {
    store: Arc<S>,
    locks: KeyedLocks,
    audit: Arc<dyn AuditLogger>,
}

impl<S: LedgerStore> Clone for CreditLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            locks: self.locks.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S: LedgerStore> CreditLedger<S> {
    /// Create a ledger that audits through `tracing`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
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
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the user's balance, creating a zero balance if none exists.
    pub async fn ensure_balance(&self, user_id: &str) -> Result<CreditBalance> {
        validate_user_id(user_id)?;
        self.store.ensure_balance(user_id).await
    }

    /// Read the user's balance. Users never touched read as zero.
    pub async fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        validate_user_id(user_id)?;
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| CreditBalance::empty(user_id)))
    }

    /// The user's transactions in creation order.
    pub async fn history(&self, user_id: &str) -> Result<Vec<CreditTransaction>> {
        validate_user_id(user_id)?;
        self.store.list_transactions(user_id).await
    }

    /// Consume credits.
    ///
    /// Grant credits are drawn first, earliest window end first.
    pub async fn consume(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<ConsumeOutcome> {
        validate_user_id(user_id)?;
        validate_amount(amount)?;

        let _guard = self.locks.lock(user_id).await;

        let balance = self.store.ensure_balance(user_id).await?;
        if balance.balance < amount {
            debug!(
                target: "ledgerlink::ledger",
                user_id = user_id,
                balance = balance.balance,
                required = amount,
                "Insufficient balance"
            );
            return Ok(ConsumeOutcome::InsufficientBalance {
                balance: balance.balance,
                required: amount,
            });
        }

        let draws = plan_draws(
            &self.store.list_drawable_grants(user_id, Utc::now()).await?,
            amount,
        );

        let mut mutation =
            LedgerMutation::new(user_id, -amount, TransactionKind::Consumption, description);
        if !draws.is_empty() {
            mutation.grant_effect = Some(GrantEffect::Draw(draws));
        }

        match self.store.apply(mutation).await? {
            ApplyOutcome::Applied {
                transaction,
                balance,
            } => {
                info!(
                    target: "ledgerlink::ledger",
                    user_id = user_id,
                    amount = amount,
                    balance = balance.balance,
                    "Credits consumed"
                );
                self.audit
                    .log(ReconcileAuditEvent::CreditsConsumed {
                        user_id: user_id.to_string(),
                        amount,
                        balance: balance.balance,
                    })
                    .await;
                Ok(ConsumeOutcome::Consumed {
                    balance: balance.balance,
                    consumed: amount,
                    transaction_id: transaction.id,
                })
            }
            ApplyOutcome::Insufficient { balance } => Ok(ConsumeOutcome::InsufficientBalance {
                balance: balance.balance,
                required: amount,
            }),
            ApplyOutcome::Duplicate { .. } => Err(LedgerLinkError::internal(
                "consumption without dedupe key reported as duplicate",
            )),
        }
    }

    /// Add bonus credits. A repeated `dedupe_key` returns the original result.
    pub async fn grant_bonus(&self, request: BonusRequest) -> Result<GrantOutcome> {
        validate_user_id(&request.user_id)?;
        validate_amount(request.amount)?;

        let mutation = LedgerMutation::new(
            &request.user_id,
            request.amount,
            TransactionKind::Bonus,
            request.reason,
        )
        .with_metadata(request.metadata)
        .with_dedupe_key(request.dedupe_key);

        self.add_credits(mutation).await
    }

    /// Add purchased credits, optionally as a time-boxed grant.
    pub async fn recharge(&self, request: RechargeRequest) -> Result<GrantOutcome> {
        validate_user_id(&request.user_id)?;
        validate_amount(request.amount)?;

        let mut mutation = LedgerMutation::new(
            &request.user_id,
            request.amount,
            TransactionKind::Recharge,
            request.description,
        )
        .with_metadata(request.metadata)
        .with_dedupe_key(request.dedupe_key);

        if let Some(window) = request.grant {
            validate_window(window.starts_at, window.ends_at)?;
            let grant = new_grant(
                &request.user_id,
                &window.subscription_ref,
                request.amount,
                window.starts_at,
                window.ends_at,
            );
            mutation = mutation.with_grant_effect(grant.id.clone(), GrantEffect::Open(grant));
        }

        self.add_credits(mutation).await
    }

    /// Open the credit grant for a newly active subscription.
    ///
    /// The grant and its bonus transaction are written together. Calling this
    /// again for the same subscription returns the original result.
    pub async fn open_subscription_grant(
        &self,
        request: SubscriptionGrantRequest,
    ) -> Result<GrantOutcome> {
        validate_user_id(&request.user_id)?;
        validate_amount(request.credits)?;
        validate_window(request.starts_at, request.ends_at)?;
        if request.subscription_ref.trim().is_empty() {
            return Err(LedgerLinkError::validation(
                "subscription_ref",
                "must not be empty",
            ));
        }

        let grant = new_grant(
            &request.user_id,
            &request.subscription_ref,
            request.credits,
            request.starts_at,
            request.ends_at,
        );
        let mutation = LedgerMutation::new(
            &request.user_id,
            request.credits,
            TransactionKind::Bonus,
            request.description,
        )
        .with_metadata(request.metadata)
        .with_dedupe_key(Some(subscription_grant_key(&request.subscription_ref)))
        .with_grant_effect(grant.id.clone(), GrantEffect::Open(grant));

        self.add_credits(mutation).await
    }

    /// Mark a subscription's active grants canceled.
    ///
    /// The balance is untouched: already granted credits remain usable until the
    /// grant window ends and the expiry sweep removes what is left.
    pub async fn cancel_grant(&self, subscription_ref: &str) -> Result<Vec<CreditGrant>> {
        let grants = self.store.list_grants_by_subscription(subscription_ref).await?;
        let mut canceled = Vec::new();

        for grant in grants {
            let _guard = self.locks.lock(&grant.user_id).await;
            // Re-read under the lock; the sweep may have expired it meanwhile.
            let Some(current) = self.store.get_grant(&grant.id).await? else {
                continue;
            };
            if current.status != GrantStatus::Active {
                continue;
            }

            self.store
                .update_grant_status(&current.id, GrantStatus::Canceled)
                .await?;
            self.audit
                .log(ReconcileAuditEvent::GrantCanceled {
                    grant_id: current.id.clone(),
                    user_id: current.user_id.clone(),
                })
                .await;
            canceled.push(CreditGrant {
                status: GrantStatus::Canceled,
                ..current
            });
        }

        Ok(canceled)
    }

    /// Expire every grant whose window ended at or before `now`.
    ///
    /// Safe to run repeatedly and alongside consumption. When a grant's remaining
    /// credits exceed the balance the deduction is clamped and a
    /// [`ReconciliationWarning`] is recorded.
    pub async fn expire_grants(&self, now: DateTime<Utc>) -> Result<ExpirySummary> {
        let mut summary = ExpirySummary::default();

        for grant in self.store.list_lapsed_grants(now).await? {
            let _guard = self.locks.lock(&grant.user_id).await;

            let Some(current) = self.store.get_grant(&grant.id).await? else {
                continue;
            };
            if !current.is_lapsed(now) {
                continue;
            }

            let balance = self.store.ensure_balance(&current.user_id).await?;
            let deduction = current.remaining_credits.min(balance.balance).max(0);

            if deduction < current.remaining_credits {
                let warning = ReconciliationWarning::new(
                    &current.user_id,
                    Some(current.id.clone()),
                    format!(
                        "grant expiry of {} credits clamped to balance {}",
                        current.remaining_credits, balance.balance
                    ),
                    current.remaining_credits,
                    deduction,
                );
                warn!(
                    target: "ledgerlink::ledger",
                    user_id = %current.user_id,
                    grant_id = %current.id,
                    remaining = current.remaining_credits,
                    balance = balance.balance,
                    "Grant expiry would drive balance negative, clamping"
                );
                self.store.record_warning(&warning).await?;
                self.audit
                    .log(ReconcileAuditEvent::ReconciliationWarning {
                        user_id: current.user_id.clone(),
                        message: warning.message.clone(),
                    })
                    .await;
                summary.warnings += 1;
            }

            if deduction > 0 {
                let mutation = LedgerMutation::new(
                    &current.user_id,
                    -deduction,
                    TransactionKind::Expiry,
                    format!("Expired credits from subscription {}", current.subscription_ref),
                )
                .with_dedupe_key(Some(format!("grant_expiry:{}", current.id)))
                .with_grant_effect(
                    current.id.clone(),
                    GrantEffect::Close {
                        grant_id: current.id.clone(),
                        status: GrantStatus::Expired,
                    },
                );

                match self.store.apply(mutation).await? {
                    ApplyOutcome::Applied { .. } => {}
                    ApplyOutcome::Duplicate { .. } => {
                        // Expiry was written earlier but the grant was left open.
                        self.store
                            .update_grant_status(&current.id, GrantStatus::Expired)
                            .await?;
                        continue;
                    }
                    ApplyOutcome::Insufficient { balance } => {
                        return Err(LedgerLinkError::internal(format!(
                            "clamped expiry for user {} exceeded balance {}",
                            current.user_id, balance.balance
                        )));
                    }
                }
            } else {
                self.store
                    .update_grant_status(&current.id, GrantStatus::Expired)
                    .await?;
            }

            summary.expired_count += 1;
            summary.recovered_credits += deduction;
            self.audit
                .log(ReconcileAuditEvent::GrantExpired {
                    grant_id: current.id.clone(),
                    user_id: current.user_id.clone(),
                    recovered: deduction,
                })
                .await;
        }

        if summary.expired_count > 0 {
            info!(
                target: "ledgerlink::ledger",
                expired_count = summary.expired_count,
                recovered_credits = summary.recovered_credits,
                warnings = summary.warnings,
                "Expired lapsed grants"
            );
        }

        Ok(summary)
    }

    /// Recompute a user's balance from the transaction log and report drift.
    pub async fn verify(&self, user_id: &str) -> Result<LedgerVerification> {
        validate_user_id(user_id)?;
        let _guard = self.locks.lock(user_id).await;

        let balance = self
            .store
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| CreditBalance::empty(user_id));
        let transactions = self.store.list_transactions(user_id).await?;

        let mut issues = Vec::new();
        let mut running = 0i64;
        for tx in &transactions {
            running += tx.amount;
            if running != tx.balance_after {
                issues.push(format!(
                    "transaction {} records balance_after {} but running sum is {}",
                    tx.id, tx.balance_after, running
                ));
            }
            if tx.balance_after < 0 {
                issues.push(format!("transaction {} left a negative balance", tx.id));
            }
        }

        if balance.balance != balance.total_recharged - balance.total_consumed {
            issues.push(format!(
                "balance {} != total_recharged {} - total_consumed {}",
                balance.balance, balance.total_recharged, balance.total_consumed
            ));
        }
        if running != balance.balance {
            issues.push(format!(
                "balance {} differs from transaction sum {}",
                balance.balance, running
            ));
        }

        if !issues.is_empty() {
            warn!(
                target: "ledgerlink::ledger",
                user_id = user_id,
                issues = issues.len(),
                "Ledger verification found drift"
            );
        }

        Ok(LedgerVerification {
            user_id: user_id.to_string(),
            balance: balance.balance,
            total_recharged: balance.total_recharged,
            total_consumed: balance.total_consumed,
            computed_balance: running,
            transaction_count: transactions.len(),
            issues,
        })
    }

    async fn add_credits(&self, mutation: LedgerMutation) -> Result<GrantOutcome> {
        let user_id = mutation.user_id.clone();
        let kind = mutation.kind;
        let _guard = self.locks.lock(&user_id).await;

        self.store.ensure_balance(&user_id).await?;
        match self.store.apply(mutation).await? {
            ApplyOutcome::Applied {
                transaction,
                balance,
            } => {
                info!(
                    target: "ledgerlink::ledger",
                    user_id = %user_id,
                    amount = transaction.amount,
                    balance = balance.balance,
                    kind = %kind,
                    "Credits added"
                );
                self.audit
                    .log(ReconcileAuditEvent::CreditsAdded {
                        user_id: user_id.clone(),
                        amount: transaction.amount,
                        balance: balance.balance,
                        kind: kind.to_string(),
                    })
                    .await;
                Ok(GrantOutcome::from_transaction(&transaction, false))
            }
            ApplyOutcome::Duplicate { transaction, .. } => {
                debug!(
                    target: "ledgerlink::ledger",
                    user_id = %user_id,
                    dedupe_key = ?transaction.dedupe_key,
                    "Duplicate credit operation skipped"
                );
                Ok(GrantOutcome::from_transaction(&transaction, true))
            }
            ApplyOutcome::Insufficient { balance } => Err(LedgerLinkError::internal(format!(
                "credit for user {} rejected at balance {}",
                user_id, balance.balance
            ))),
        }
    }
}

/// Dedupe key used for the opening transaction of a subscription grant.
#[must_use]
pub fn subscription_grant_key(subscription_ref: &str) -> String {
    format!("subscription_grant:{}", subscription_ref)
}

/// Split `amount` across drawable grants in the order given.
fn plan_draws(grants: &[CreditGrant], amount: i64) -> Vec<GrantDraw> {
    let mut left = amount;
    let mut draws = Vec::new();
    for grant in grants {
        if left == 0 {
            break;
        }
        let take = grant.remaining_credits.min(left);
        if take > 0 {
            draws.push(GrantDraw {
                grant_id: grant.id.clone(),
                amount: take,
            });
            left -= take;
        }
    }
    draws
}

fn new_grant(
    user_id: &str,
    subscription_ref: &str,
    credits: i64,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> CreditGrant {
    CreditGrant {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        subscription_ref: subscription_ref.to_string(),
        total_credits: credits,
        remaining_credits: credits,
        starts_at,
        ends_at,
        status: GrantStatus::Active,
        created_at: Utc::now(),
    }
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(LedgerLinkError::validation("user_id", "must not be empty"));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerLinkError::validation(
            "amount",
            format!("must be a positive integer, got {}", amount),
        ));
    }
    Ok(())
}

fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    if ends_at <= starts_at {
        return Err(LedgerLinkError::validation(
            "ends_at",
            "grant window must end after it starts",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditLogger;
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    fn ledger() -> (CreditLedger<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (CreditLedger::new(store.clone()), store)
    }

    async fn funded(amount: i64) -> (CreditLedger<InMemoryStore>, Arc<InMemoryStore>) {
        let (ledger, store) = ledger();
        ledger
            .grant_bonus(BonusRequest::new("user_1", amount, "seed"))
            .await
            .unwrap();
        (ledger, store)
    }

    fn grant_request(subscription_ref: &str, credits: i64, ends_in: Duration) -> SubscriptionGrantRequest {
        let now = Utc::now();
        SubscriptionGrantRequest {
            user_id: "user_1".to_string(),
            subscription_ref: subscription_ref.to_string(),
            credits,
            starts_at: now - Duration::days(30),
            ends_at: now + ends_in,
            description: "Subscription credits".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_consume_decrements_and_logs() {
        let (ledger, _) = funded(10).await;

        let outcome = ledger.consume("user_1", 5, "x").await.unwrap();
        assert!(outcome.is_consumed());
        assert_eq!(outcome.balance(), 5);

        let history = ledger.history("user_1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].amount, -5);
        assert_eq!(history[1].balance_after, 5);
        assert_eq!(history[1].kind, TransactionKind::Consumption);

        let balance = ledger.balance("user_1").await.unwrap();
        assert_eq!(balance.total_consumed, 5);
        assert!(balance.is_consistent());
    }

    #[tokio::test]
    async fn test_consume_insufficient_is_outcome_not_error() {
        let (ledger, _) = funded(3).await;

        let outcome = ledger.consume("user_1", 5, "x").await.unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::InsufficientBalance {
                balance: 3,
                required: 5
            }
        );
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let (ledger, _) = funded(10).await;

        for amount in [0, -3] {
            let err = ledger.consume("user_1", amount, "x").await.unwrap_err();
            assert!(matches!(err, LedgerLinkError::Validation { field: "amount", .. }));
            assert!(ledger
                .grant_bonus(BonusRequest::new("user_1", amount, "bad"))
                .await
                .is_err());
        }
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bonus_past_i64_range_is_rejected() {
        let (ledger, _) = funded(i64::MAX).await;

        let err = ledger
            .grant_bonus(BonusRequest::new("user_1", 1, "one more"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(ledger.balance("user_1").await.unwrap().balance, i64::MAX);
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 1);

        let other = ledger
            .grant_bonus(BonusRequest::new("user_2", 5, "seed"))
            .await
            .unwrap();
        assert_eq!(other.balance, 5);
        assert_eq!(ledger.consume("user_1", 1, "x").await.unwrap().balance(), i64::MAX - 1);
    }

    #[tokio::test]
    async fn test_grant_bonus_creates_balance_on_first_touch() {
        let (ledger, store) = ledger();
        assert!(store.get_balance("user_new").await.unwrap().is_none());

        let outcome = ledger
            .grant_bonus(BonusRequest::new("user_new", 7, "welcome"))
            .await
            .unwrap();
        assert_eq!(outcome.balance, 7);
        assert_eq!(outcome.added, 7);
        assert!(!outcome.duplicate);

        let balance = ledger.balance("user_new").await.unwrap();
        assert_eq!(balance.total_recharged, 7);
    }

    #[tokio::test]
    async fn test_grant_bonus_dedupe_key() {
        let (ledger, _) = ledger();
        let request = BonusRequest::new("user_1", 5, "signup").with_dedupe_key("signup_user_1");

        let first = ledger.grant_bonus(request.clone()).await.unwrap();
        let second = ledger.grant_bonus(request).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(first.balance, second.balance);
        assert_eq!(first.added, second.added);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 1);
        assert_eq!(ledger.balance("user_1").await.unwrap().balance, 5);
    }

    #[tokio::test]
    async fn test_consumption_draws_earliest_grant_first() {
        let (ledger, store) = ledger();
        ledger
            .open_subscription_grant(grant_request("sub_late", 10, Duration::days(20)))
            .await
            .unwrap();
        ledger
            .open_subscription_grant(grant_request("sub_early", 4, Duration::days(2)))
            .await
            .unwrap();

        ledger.consume("user_1", 6, "job").await.unwrap();

        let early = &store.list_grants_by_subscription("sub_early").await.unwrap()[0];
        let late = &store.list_grants_by_subscription("sub_late").await.unwrap()[0];
        assert_eq!(early.remaining_credits, 0);
        assert_eq!(late.remaining_credits, 8);
    }

    #[tokio::test]
    async fn test_open_subscription_grant_is_idempotent() {
        let (ledger, store) = ledger();
        let first = ledger
            .open_subscription_grant(grant_request("sub_1", 10, Duration::days(10)))
            .await
            .unwrap();
        let second = ledger
            .open_subscription_grant(grant_request("sub_1", 10, Duration::days(10)))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(store.list_grants("user_1").await.unwrap().len(), 1);
        assert_eq!(ledger.balance("user_1").await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_cancel_grant_keeps_credits() {
        let (ledger, store) = ledger();
        ledger
            .open_subscription_grant(grant_request("sub_1", 10, Duration::days(10)))
            .await
            .unwrap();

        let canceled = ledger.cancel_grant("sub_1").await.unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].status, GrantStatus::Canceled);
        assert_eq!(ledger.balance("user_1").await.unwrap().balance, 10);

        // Second cancel finds nothing active.
        assert!(ledger.cancel_grant("sub_1").await.unwrap().is_empty());
        let grant = &store.list_grants("user_1").await.unwrap()[0];
        assert_eq!(grant.remaining_credits, 10);
    }

    #[tokio::test]
    async fn test_expire_grants_deducts_remaining() {
        let (ledger, store) = ledger();
        ledger
            .open_subscription_grant(grant_request("sub_1", 10, Duration::days(1)))
            .await
            .unwrap();
        ledger.consume("user_1", 7, "usage").await.unwrap();

        let later = Utc::now() + Duration::days(2);
        let summary = ledger.expire_grants(later).await.unwrap();
        assert_eq!(summary.expired_count, 1);
        assert_eq!(summary.recovered_credits, 3);
        assert_eq!(summary.warnings, 0);

        let history = ledger.history("user_1").await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.kind, TransactionKind::Expiry);
        assert_eq!(last.amount, -3);
        assert_eq!(last.balance_after, 0);

        let grant = &store.list_grants("user_1").await.unwrap()[0];
        assert_eq!(grant.status, GrantStatus::Expired);
        assert_eq!(grant.remaining_credits, 0);

        // Re-running is a no-op.
        let again = ledger.expire_grants(later).await.unwrap();
        assert_eq!(again, ExpirySummary::default());
    }

    #[tokio::test]
    async fn test_expire_grants_clamps_and_warns() {
        let store = Arc::new(InMemoryStore::new());
        let audit = RecordingAuditLogger::new();
        let ledger = CreditLedger::new(store.clone()).with_audit_logger(Arc::new(audit.clone()));

        ledger
            .open_subscription_grant(grant_request("sub_1", 10, Duration::days(1)))
            .await
            .unwrap();
        // Drift the grant above the balance, as a crashed writer could.
        store.force_grant_remaining("sub_1", 15);

        let summary = ledger
            .expire_grants(Utc::now() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(summary.recovered_credits, 10);
        assert_eq!(summary.warnings, 1);

        let balance = ledger.balance("user_1").await.unwrap();
        assert_eq!(balance.balance, 0);
        assert!(balance.is_consistent());

        let warnings = store.list_warnings(10).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].expected_amount, 15);
        assert_eq!(warnings[0].applied_amount, 10);
        assert_eq!(audit.events_of_kind("reconciliation_warning").await.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_with_zero_balance_only_closes_grant() {
        let (ledger, store) = ledger();
        ledger
            .open_subscription_grant(grant_request("sub_1", 4, Duration::days(1)))
            .await
            .unwrap();
        ledger.consume("user_1", 4, "all").await.unwrap();

        let summary = ledger
            .expire_grants(Utc::now() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(summary.expired_count, 1);
        assert_eq!(summary.recovered_credits, 0);
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 2);
        assert_eq!(
            store.list_grants("user_1").await.unwrap()[0].status,
            GrantStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_recharge_with_grant_window() {
        let (ledger, store) = ledger();
        let now = Utc::now();
        let outcome = ledger
            .recharge(RechargeRequest {
                user_id: "user_1".to_string(),
                amount: 20,
                description: "Invoice in_1".to_string(),
                dedupe_key: Some("invoice:in_1".to_string()),
                grant: Some(GrantWindow {
                    subscription_ref: "sub_1".to_string(),
                    starts_at: now,
                    ends_at: now + Duration::days(30),
                }),
                ..RechargeRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.balance, 20);

        let history = ledger.history("user_1").await.unwrap();
        assert_eq!(history[0].kind, TransactionKind::Recharge);
        assert!(history[0].grant_id.is_some());
        assert_eq!(store.list_grants("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_consumes_never_overdraw() {
        let (ledger, _) = funded(10).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.consume("user_1", 3, &format!("job {}", i)).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_consumed() {
                successes += 1;
            }
        }

        assert_eq!(successes, 3);
        let balance = ledger.balance("user_1").await.unwrap();
        assert_eq!(balance.balance, 1);
        assert!(ledger.verify("user_1").await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_verify_reports_consistent_history() {
        let (ledger, _) = funded(10).await;
        ledger.consume("user_1", 4, "a").await.unwrap();
        ledger
            .grant_bonus(BonusRequest::new("user_1", 2, "b"))
            .await
            .unwrap();

        let report = ledger.verify("user_1").await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.issues);
        assert_eq!(report.computed_balance, 8);
        assert_eq!(report.transaction_count, 3);
    }

    #[test]
    fn test_plan_draws() {
        let now = Utc::now();
        let grant = |id: &str, remaining: i64| CreditGrant {
            id: id.to_string(),
            user_id: "u".to_string(),
            subscription_ref: "s".to_string(),
            total_credits: remaining,
            remaining_credits: remaining,
            starts_at: now,
            ends_at: now,
            status: GrantStatus::Active,
            created_at: now,
        };

        let draws = plan_draws(&[grant("a", 2), grant("b", 5)], 4);
        assert_eq!(
            draws,
            vec![
                GrantDraw { grant_id: "a".to_string(), amount: 2 },
                GrantDraw { grant_id: "b".to_string(), amount: 2 },
            ]
        );
        assert!(plan_draws(&[], 4).is_empty());
    }
}
