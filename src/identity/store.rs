//! Storage traits for identity data.
//!
//! [`IdentityStore`] holds customer links, the unresolved-reference queue and
//! parked events. [`UserDirectory`] is read-only access to local users, which
//! are owned elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::strategies::{Confidence, MatchStrategy};
use crate::error::{LinkOwner, Result};

/// Trait for persisting identity state.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    // Customer links

    /// Active link for an external reference.
    async fn find_link_by_ref(&self, external_ref: &str) -> Result<Option<CustomerLink>>;

    /// Active link for a local user.
    async fn find_link_by_user(&self, user_id: &str) -> Result<Option<CustomerLink>>;

    /// Every link ever created for a reference, oldest first, superseded ones included.
    async fn list_links_for_ref(&self, external_ref: &str) -> Result<Vec<CustomerLink>>;

    /// Insert a link unless either side is already linked.
    ///
    /// Must check both directions and insert in one atomic unit. An existing
    /// active link for the same pair is reported as [`LinkWrite::AlreadyLinked`].
    async fn create_link(&self, link: &CustomerLink) -> Result<LinkWrite>;

    /// Mark `superseded_id` inactive and insert `link` in one atomic unit.
    ///
    /// Fails with [`LinkWrite::Conflict`] if the new user is linked to another
    /// reference through a link other than the one being superseded.
    async fn replace_link(&self, superseded_id: &str, link: &CustomerLink) -> Result<LinkWrite>;

    // Unresolved references

    /// Insert or merge an unresolved reference, keyed by external reference.
    ///
    /// An existing entry keeps its status and creation time, has its context
    /// merged with the new snapshot and its attempt count incremented.
    async fn upsert_unresolved(&self, reference: &UnresolvedReference) -> Result<UnresolvedReference>;

    async fn get_unresolved(&self, external_ref: &str) -> Result<Option<UnresolvedReference>>;

    /// Entries in a status, oldest first.
    async fn list_unresolved(&self, status: UnresolvedStatus) -> Result<Vec<UnresolvedReference>>;

    /// `pending -> resolved`. Returns false if the entry was missing or not pending.
    async fn mark_resolved(&self, external_ref: &str, user_id: &str) -> Result<bool>;

    /// `pending -> abandoned`. Returns false if the entry was missing or not pending.
    async fn mark_abandoned(&self, external_ref: &str, note: Option<&str>) -> Result<bool>;

    // Parked events

    /// Store an event verbatim. Returns false if the event key was already parked.
    async fn park_event(&self, event: &ParkedEvent) -> Result<bool>;

    /// Events still waiting on a reference, oldest first.
    async fn list_parked(&self, external_ref: &str) -> Result<Vec<ParkedEvent>>;

    async fn mark_parked_replayed(&self, event_key: &str) -> Result<()>;
}

/// Read access to local users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<LocalUser>>;

    /// Users whose email equals `email` exactly.
    async fn find_by_email(&self, email: &str) -> Result<Vec<LocalUser>>;

    /// Users whose display name may match `name`. Over-inclusive is fine;
    /// the fuzzy strategy does the final filtering.
    async fn find_by_name_fragment(&self, name: &str) -> Result<Vec<LocalUser>>;

    /// Free-text search over id, email and display name for operators.
    async fn search_users(&self, query: &str, limit: usize) -> Result<Vec<LocalUser>>;
}

/// A local user as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    /// Replaced by a repair; kept for history.
    Superseded,
}

impl LinkStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

/// One local user <-> one external customer reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerLink {
    pub id: String,
    pub user_id: String,
    pub external_ref: String,
    pub strategy: MatchStrategy,
    pub confidence: Confidence,
    pub status: LinkStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl CustomerLink {
    /// A new active link.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        external_ref: impl Into<String>,
        strategy: MatchStrategy,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            external_ref: external_ref.into(),
            strategy,
            confidence: strategy.confidence(),
            status: LinkStatus::Active,
            note: None,
            created_at: Utc::now(),
            superseded_at: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active
    }
}

/// Result of a link write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkWrite {
    Created(CustomerLink),
    /// The same user and reference were already linked.
    AlreadyLinked(CustomerLink),
    /// One side is linked elsewhere. Nothing was written.
    Conflict(LinkOwner),
}

/// Unresolved reference status. Transitions only leave `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedStatus {
    Pending,
    Resolved,
    Abandoned,
}

impl UnresolvedStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// Snapshot of what was known about a reference when matching failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl ReferenceContext {
    /// Merge a newer snapshot in. Newer non-empty values win, nothing is dropped.
    pub fn merge(&mut self, newer: &ReferenceContext) {
        fn take(slot: &mut Option<String>, newer: &Option<String>) {
            if let Some(value) = newer.as_ref().filter(|v| !v.trim().is_empty()) {
                *slot = Some(value.clone());
            }
        }
        take(&mut self.subscription_ref, &newer.subscription_ref);
        take(&mut self.email, &newer.email);
        take(&mut self.name, &newer.name);
        take(&mut self.event_type, &newer.event_type);
        for (k, v) in &newer.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        if newer.observed_at.is_some() {
            self.observed_at = newer.observed_at;
        }
    }
}

/// An external reference seen in an event with no link, queued for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub external_ref: String,
    pub status: UnresolvedStatus,
    pub context: ReferenceContext,
    /// Why the last attempt failed (`no_candidate`, `ambiguous`, ...).
    pub reason: String,
    /// Candidate user ids from the last attempt, for ambiguity or low confidence.
    pub candidates: Vec<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_user_id: Option<String>,
    pub note: Option<String>,
}

impl UnresolvedReference {
    #[must_use]
    pub fn pending(
        external_ref: impl Into<String>,
        context: ReferenceContext,
        reason: impl Into<String>,
        candidates: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            external_ref: external_ref.into(),
            status: UnresolvedStatus::Pending,
            context,
            reason: reason.into(),
            candidates,
            attempts: 1,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_user_id: None,
            note: None,
        }
    }

    /// Fold a newer observation into an existing entry. Status is left alone.
    pub fn absorb(&mut self, newer: &UnresolvedReference) {
        self.context.merge(&newer.context);
        self.reason = newer.reason.clone();
        self.candidates = newer.candidates.clone();
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = Utc::now();
    }
}

/// Parked event status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParkedStatus {
    Parked,
    Replayed,
}

impl ParkedStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parked => "parked",
            Self::Replayed => "replayed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parked" => Some(Self::Parked),
            "replayed" => Some(Self::Replayed),
            _ => None,
        }
    }
}

/// A billing event stored verbatim while its reference is unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedEvent {
    pub event_key: String,
    pub external_ref: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: ParkedStatus,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_link_carries_strategy_confidence() {
        let link = CustomerLink::new("user_1", "cus_abc", MatchStrategy::Email);
        assert_eq!(link.confidence, Confidence::Medium);
        assert!(link.is_active());
        assert!(link.superseded_at.is_none());
    }

    #[test]
    fn test_context_merge_keeps_richest_snapshot() {
        let mut base = ReferenceContext {
            email: Some("a@b.com".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            ..ReferenceContext::default()
        };
        base.metadata.insert("plan".to_string(), "pro".to_string());

        let mut newer = ReferenceContext {
            name: Some("Jane".to_string()),
            email: Some("   ".to_string()),
            ..ReferenceContext::default()
        };
        newer.metadata.insert("seats".to_string(), "2".to_string());

        base.merge(&newer);
        assert_eq!(base.email.as_deref(), Some("a@b.com"));
        assert_eq!(base.name.as_deref(), Some("Jane"));
        assert_eq!(base.subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(base.metadata.len(), 2);
    }

    #[test]
    fn test_absorb_bumps_attempts() {
        let mut first = UnresolvedReference::pending(
            "cus_abc",
            ReferenceContext::default(),
            "no_candidate",
            vec![],
        );
        let second = UnresolvedReference::pending(
            "cus_abc",
            ReferenceContext {
                email: Some("a@b.com".to_string()),
                ..ReferenceContext::default()
            },
            "ambiguous",
            vec!["user_1".to_string(), "user_2".to_string()],
        );
        first.absorb(&second);
        assert_eq!(first.attempts, 2);
        assert_eq!(first.reason, "ambiguous");
        assert_eq!(first.candidates.len(), 2);
        assert_eq!(first.status, UnresolvedStatus::Pending);
        assert_eq!(first.context.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            UnresolvedStatus::Pending,
            UnresolvedStatus::Resolved,
            UnresolvedStatus::Abandoned,
        ] {
            assert_eq!(UnresolvedStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LinkStatus::parse("superseded"), Some(LinkStatus::Superseded));
        assert_eq!(ParkedStatus::parse("replayed"), Some(ParkedStatus::Replayed));
    }
}
