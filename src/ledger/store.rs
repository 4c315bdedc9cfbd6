//! Storage trait for the credit ledger.
//!
//! A store is pure persistence: it never decides whether an operation is
//! allowed. The one exception is [`LedgerStore::apply`], which must perform the
//! balance update, the transaction append and any grant effect as one atomic
//! unit, and must refuse to take a balance below zero.

use crate::error::{LedgerLinkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trait for persisting balances, transactions, grants and reconciliation warnings.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Balances

    /// Get a user's balance row, if one was ever created.
    async fn get_balance(&self, user_id: &str) -> Result<Option<CreditBalance>>;

    /// Get a user's balance row, creating a zero balance on first touch.
    async fn ensure_balance(&self, user_id: &str) -> Result<CreditBalance>;

    /// Apply a mutation atomically.
    ///
    /// Must, in one atomic unit:
    /// - return [`ApplyOutcome::Duplicate`] if `dedupe_key` is set and a transaction
    ///   with that key already exists for the user;
    /// - return [`ApplyOutcome::Insufficient`] without writing anything if the
    ///   resulting balance would be negative;
    /// - otherwise update the totals, recompute `balance = total_recharged - total_consumed`,
    ///   append the transaction with the resulting balance and apply the grant effect.
    async fn apply(&self, mutation: LedgerMutation) -> Result<ApplyOutcome>;

    // Transactions

    /// Find a user's transaction by dedupe key.
    async fn find_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<CreditTransaction>>;

    /// List a user's transactions in creation order.
    async fn list_transactions(&self, user_id: &str) -> Result<Vec<CreditTransaction>>;

    // Grants

    async fn get_grant(&self, grant_id: &str) -> Result<Option<CreditGrant>>;

    /// List grants opened for an external subscription, oldest first.
    async fn list_grants_by_subscription(&self, subscription_ref: &str) -> Result<Vec<CreditGrant>>;

    /// List all of a user's grants, oldest first.
    async fn list_grants(&self, user_id: &str) -> Result<Vec<CreditGrant>>;

    /// Active or canceled grants whose window ended at or before `now`.
    async fn list_lapsed_grants(&self, now: DateTime<Utc>) -> Result<Vec<CreditGrant>>;

    /// A user's grants that consumption may draw from, earliest window end first.
    async fn list_drawable_grants(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditGrant>>;

    /// Set a grant's status without touching the balance.
    ///
    /// Moving a grant to [`GrantStatus::Expired`] also zeroes its remaining credits.
    async fn update_grant_status(&self, grant_id: &str, status: GrantStatus) -> Result<()>;

    // Reconciliation warnings

    async fn record_warning(&self, warning: &ReconciliationWarning) -> Result<()>;

    /// Most recent warnings first.
    async fn list_warnings(&self, limit: usize) -> Result<Vec<ReconciliationWarning>>;
}

/// Per-user credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: String,
    pub balance: i64,
    pub total_recharged: i64,
    pub total_consumed: i64,
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    /// A zero balance for a user seen for the first time.
    #[must_use]
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            total_recharged: 0,
            total_consumed: 0,
            updated_at: Utc::now(),
        }
    }

    /// Check `balance == total_recharged - total_consumed` and `balance >= 0`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.balance == self.total_recharged - self.total_consumed && self.balance >= 0
    }

    /// Totals after applying a signed amount. Credits count as recharged,
    /// debits (consumption and expiry) count as consumed.
    ///
    /// Fails with a validation error when a total would overflow.
    pub fn with_amount(&self, amount: i64) -> Result<Self> {
        let overflow = || LedgerLinkError::validation("amount", "credit totals would overflow");
        let mut next = self.clone();
        if amount >= 0 {
            next.total_recharged = next.total_recharged.checked_add(amount).ok_or_else(overflow)?;
        } else {
            let debit = amount.checked_neg().ok_or_else(overflow)?;
            next.total_consumed = next.total_consumed.checked_add(debit).ok_or_else(overflow)?;
        }
        next.balance = next
            .total_recharged
            .checked_sub(next.total_consumed)
            .ok_or_else(overflow)?;
        next.updated_at = Utc::now();
        Ok(next)
    }
}

/// Transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Consumption,
    Bonus,
    Recharge,
    Expiry,
}

impl TransactionKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumption => "consumption",
            Self::Bonus => "bonus",
            Self::Recharge => "recharge",
            Self::Expiry => "expiry",
        }
    }

    /// Parse a stored value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "consumption" => Some(Self::Consumption),
            "bonus" => Some(Self::Bonus),
            "recharge" => Some(Self::Recharge),
            "expiry" => Some(Self::Expiry),
            _ => None,
        }
    }

    /// Whether transactions of this kind add credits.
    #[must_use]
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::Bonus | Self::Recharge)
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    /// Signed amount: positive for bonus and recharge, negative for consumption and expiry.
    pub amount: i64,
    /// Balance immediately after this transaction.
    pub balance_after: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub metadata: serde_json::Value,
    pub grant_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Grant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Expired,
    Canceled,
}

impl GrantStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-boxed allotment of credits tied to an external subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: String,
    pub user_id: String,
    pub subscription_ref: String,
    pub total_credits: i64,
    pub remaining_credits: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: GrantStatus,
    pub created_at: DateTime<Utc>,
}

impl CreditGrant {
    /// Window ended while the grant still holds its status.
    ///
    /// Canceled grants lapse too: their credits stay usable until the window ends.
    #[must_use]
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status != GrantStatus::Expired && self.ends_at <= now
    }

    /// Consumption may draw from this grant.
    #[must_use]
    pub fn is_drawable(&self, now: DateTime<Utc>) -> bool {
        self.status != GrantStatus::Expired && self.ends_at > now && self.remaining_credits > 0
    }
}

/// Part of a consumption charged to one grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDraw {
    pub grant_id: String,
    pub amount: i64,
}

/// Change to grants applied together with a ledger write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantEffect {
    /// Insert a new grant.
    Open(CreditGrant),
    /// Decrement remaining credits on one or more grants.
    Draw(Vec<GrantDraw>),
    /// Move a grant to a terminal status. Expiry also zeroes remaining credits.
    Close {
        grant_id: String,
        status: GrantStatus,
    },
}

/// A single balance-affecting write.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerMutation {
    pub user_id: String,
    /// Signed amount. Never zero.
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub metadata: serde_json::Value,
    pub grant_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub grant_effect: Option<GrantEffect>,
}

impl LedgerMutation {
    /// Build a mutation with no metadata, grant or dedupe key.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        amount: i64,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            kind,
            description: description.into(),
            metadata: serde_json::Value::Null,
            grant_id: None,
            dedupe_key: None,
            grant_effect: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_dedupe_key(mut self, key: Option<String>) -> Self {
        self.dedupe_key = key;
        self
    }

    #[must_use]
    pub fn with_grant_effect(mut self, grant_id: impl Into<String>, effect: GrantEffect) -> Self {
        self.grant_id = Some(grant_id.into());
        self.grant_effect = Some(effect);
        self
    }

    /// Build the transaction record this mutation produces on top of `balance_after`.
    #[must_use]
    pub fn to_transaction(&self, balance_after: i64) -> CreditTransaction {
        CreditTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            amount: self.amount,
            balance_after,
            kind: self.kind,
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            grant_id: self.grant_id.clone(),
            dedupe_key: self.dedupe_key.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Result of [`LedgerStore::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The mutation was written.
    Applied {
        transaction: CreditTransaction,
        balance: CreditBalance,
    },
    /// A transaction with the same dedupe key already existed; nothing was written.
    Duplicate {
        transaction: CreditTransaction,
        balance: CreditBalance,
    },
    /// The balance would have gone negative; nothing was written.
    Insufficient { balance: CreditBalance },
}

/// A ledger operation that completed with a clamped effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationWarning {
    pub id: String,
    pub user_id: String,
    pub grant_id: Option<String>,
    pub message: String,
    /// Deduction the operation asked for.
    pub expected_amount: i64,
    /// Deduction actually applied.
    pub applied_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationWarning {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        grant_id: Option<String>,
        message: impl Into<String>,
        expected_amount: i64,
        applied_amount: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            grant_id,
            message: message.into(),
            expected_amount,
            applied_amount,
            created_at: Utc::now(),
        }
    }
}
