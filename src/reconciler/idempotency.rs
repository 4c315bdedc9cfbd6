use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trait for recording which billing events have already been applied.
///
/// A redelivered event is answered from here instead of being applied again.
#[async_trait]
pub trait AppliedEventStore: Send + Sync {
    /// The recorded result for an event key, if it was applied.
    async fn get(&self, event_key: &str) -> Result<Option<AppliedEvent>>;

    /// Record an applied event. Returns false if the key was already recorded,
    /// in which case the existing record is kept.
    async fn record(&self, event: AppliedEvent) -> Result<bool>;

    /// Delete records applied more than `days` ago. Returns how many were removed.
    async fn cleanup_older_than(&self, _days: u32) -> Result<u64> {
        Ok(0)
    }
}

/// An event key that has been applied, with its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEvent {
    pub event_key: String,
    pub event_type: String,
    pub result: AppliedResult,
    pub applied_at: DateTime<Utc>,
}

impl AppliedEvent {
    #[must_use]
    pub fn new(
        event_key: impl Into<String>,
        event_type: impl Into<String>,
        result: AppliedResult,
    ) -> Self {
        Self {
            event_key: event_key.into(),
            event_type: event_type.into(),
            result,
            applied_at: Utc::now(),
        }
    }
}

/// What applying an event did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum AppliedResult {
    /// Credits were added, or an earlier identical credit was found.
    Credited {
        user_id: String,
        transaction_id: String,
        added: i64,
        balance: i64,
    },
    /// Grants of a subscription were canceled.
    GrantsCanceled {
        user_id: String,
        grant_ids: Vec<String>,
    },
    /// The event had no ledger effect.
    Ignored,
}

impl AppliedResult {
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Credited { user_id, .. } | Self::GrantsCanceled { user_id, .. } => Some(user_id),
            Self::Ignored => None,
        }
    }
}
