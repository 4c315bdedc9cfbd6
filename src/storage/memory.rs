//! In-memory store for development and tests.
//!
//! Implements every store trait of the crate on one struct. Each area lives
//! behind its own lock, and a ledger write holds the ledger lock for its whole
//! read-check-write, which gives [`LedgerStore::apply`] its atomicity.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{LedgerLinkError, LinkOwner, Result};
use crate::identity::{
    CustomerLink, IdentityStore, LinkStatus, LinkWrite, LocalUser, ParkedEvent, ParkedStatus,
    UnresolvedReference, UnresolvedStatus, UserDirectory, normalize_name,
};
use crate::ledger::{
    ApplyOutcome, CreditBalance, CreditGrant, CreditTransaction, GrantEffect, GrantStatus,
    LedgerMutation, LedgerStore, ReconciliationWarning,
};
use crate::reconciler::{AppliedEvent, AppliedEventStore};

/// In-memory implementation of every store trait.
///
/// Cloning is cheap and clones share state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<InMemoryStoreInner>,
}

#[derive(Debug, Default)]
struct InMemoryStoreInner {
    ledger: RwLock<LedgerState>,
    identity: RwLock<IdentityState>,
    users: RwLock<BTreeMap<String, LocalUser>>,
    applied: RwLock<HashMap<String, AppliedEvent>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, CreditBalance>,
    transactions: HashMap<String, Vec<CreditTransaction>>,
    grants: HashMap<String, CreditGrant>,
    warnings: Vec<ReconciliationWarning>,
}

#[derive(Debug, Default)]
struct IdentityState {
    links: Vec<CustomerLink>,
    unresolved: HashMap<String, UnresolvedReference>,
    parked: Vec<ParkedEvent>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| LedgerLinkError::storage("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| LedgerLinkError::storage("in-memory store lock poisoned"))
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a local user.
    pub fn add_user(&self, id: &str, email: Option<&str>, display_name: Option<&str>) {
        self.add_local_user(LocalUser {
            id: id.to_string(),
            email: email.map(String::from),
            display_name: display_name.map(String::from),
        });
    }

    pub fn add_local_user(&self, user: LocalUser) {
        if let Ok(mut users) = self.inner.users.write() {
            users.insert(user.id.clone(), user);
        }
    }

    /// Overwrite the remaining credits of a subscription's grants (for testing
    /// drift between grants and balance).
    pub fn force_grant_remaining(&self, subscription_ref: &str, remaining: i64) {
        if let Ok(mut state) = self.inner.ledger.write() {
            for grant in state
                .grants
                .values_mut()
                .filter(|g| g.subscription_ref == subscription_ref)
            {
                grant.remaining_credits = remaining;
            }
        }
    }
}

impl LedgerState {
    fn balance_of(&self, user_id: &str) -> CreditBalance {
        self.balances
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| CreditBalance::empty(user_id))
    }

    /// Check a grant effect can be applied before anything is written.
    fn check_grant_effect(&self, effect: &GrantEffect) -> Result<()> {
        match effect {
            GrantEffect::Open(grant) => {
                if self.grants.contains_key(&grant.id) {
                    return Err(LedgerLinkError::storage(format!(
                        "grant {} already exists",
                        grant.id
                    )));
                }
            }
            GrantEffect::Draw(draws) => {
                for draw in draws {
                    let grant = self
                        .grants
                        .get(&draw.grant_id)
                        .ok_or_else(|| LedgerLinkError::not_found("grant", &draw.grant_id))?;
                    if grant.remaining_credits < draw.amount {
                        return Err(LedgerLinkError::storage(format!(
                            "grant {} has {} credits left, draw of {} refused",
                            grant.id, grant.remaining_credits, draw.amount
                        )));
                    }
                }
            }
            GrantEffect::Close { grant_id, .. } => {
                if !self.grants.contains_key(grant_id) {
                    return Err(LedgerLinkError::not_found("grant", grant_id));
                }
            }
        }
        Ok(())
    }

    fn apply_grant_effect(&mut self, effect: GrantEffect) {
        match effect {
            GrantEffect::Open(grant) => {
                self.grants.insert(grant.id.clone(), grant);
            }
            GrantEffect::Draw(draws) => {
                for draw in draws {
                    if let Some(grant) = self.grants.get_mut(&draw.grant_id) {
                        grant.remaining_credits -= draw.amount;
                    }
                }
            }
            GrantEffect::Close { grant_id, status } => {
                if let Some(grant) = self.grants.get_mut(&grant_id) {
                    grant.status = status;
                    if status == GrantStatus::Expired {
                        grant.remaining_credits = 0;
                    }
                }
            }
        }
    }
}

fn sorted_grants<'a>(grants: impl Iterator<Item = &'a CreditGrant>) -> Vec<CreditGrant> {
    let mut grants: Vec<CreditGrant> = grants.cloned().collect();
    grants.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    grants
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn get_balance(&self, user_id: &str) -> Result<Option<CreditBalance>> {
        Ok(read(&self.inner.ledger)?.balances.get(user_id).cloned())
    }

    async fn ensure_balance(&self, user_id: &str) -> Result<CreditBalance> {
        let mut state = write(&self.inner.ledger)?;
        Ok(state
            .balances
            .entry(user_id.to_string())
            .or_insert_with(|| CreditBalance::empty(user_id))
            .clone())
    }

    async fn apply(&self, mutation: LedgerMutation) -> Result<ApplyOutcome> {
        let mut state = write(&self.inner.ledger)?;
        let user_id = mutation.user_id.clone();

        if let Some(key) = &mutation.dedupe_key {
            let existing = state
                .transactions
                .get(&user_id)
                .and_then(|txs| txs.iter().find(|t| t.dedupe_key.as_ref() == Some(key)))
                .cloned();
            if let Some(transaction) = existing {
                return Ok(ApplyOutcome::Duplicate {
                    transaction,
                    balance: state.balance_of(&user_id),
                });
            }
        }

        let current = state.balance_of(&user_id);
        let next = current.with_amount(mutation.amount)?;
        if next.balance < 0 {
            return Ok(ApplyOutcome::Insufficient { balance: current });
        }

        if let Some(effect) = &mutation.grant_effect {
            state.check_grant_effect(effect)?;
        }

        let transaction = mutation.to_transaction(next.balance);
        if let Some(effect) = mutation.grant_effect {
            state.apply_grant_effect(effect);
        }
        state.balances.insert(user_id.clone(), next.clone());
        state
            .transactions
            .entry(user_id)
            .or_default()
            .push(transaction.clone());

        Ok(ApplyOutcome::Applied {
            transaction,
            balance: next,
        })
    }

    async fn find_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<CreditTransaction>> {
        let state = read(&self.inner.ledger)?;
        Ok(state
            .transactions
            .get(user_id)
            .and_then(|txs| txs.iter().find(|t| t.dedupe_key.as_deref() == Some(dedupe_key)))
            .cloned())
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<CreditTransaction>> {
        let state = read(&self.inner.ledger)?;
        Ok(state.transactions.get(user_id).cloned().unwrap_or_default())
    }

    async fn get_grant(&self, grant_id: &str) -> Result<Option<CreditGrant>> {
        Ok(read(&self.inner.ledger)?.grants.get(grant_id).cloned())
    }

    async fn list_grants_by_subscription(&self, subscription_ref: &str) -> Result<Vec<CreditGrant>> {
        let state = read(&self.inner.ledger)?;
        Ok(sorted_grants(
            state
                .grants
                .values()
                .filter(|g| g.subscription_ref == subscription_ref),
        ))
    }

    async fn list_grants(&self, user_id: &str) -> Result<Vec<CreditGrant>> {
        let state = read(&self.inner.ledger)?;
        Ok(sorted_grants(
            state.grants.values().filter(|g| g.user_id == user_id),
        ))
    }

    async fn list_lapsed_grants(&self, now: DateTime<Utc>) -> Result<Vec<CreditGrant>> {
        let state = read(&self.inner.ledger)?;
        let mut grants = sorted_grants(state.grants.values().filter(|g| g.is_lapsed(now)));
        grants.sort_by_key(|g| g.ends_at);
        Ok(grants)
    }

    async fn list_drawable_grants(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditGrant>> {
        let state = read(&self.inner.ledger)?;
        let mut grants = sorted_grants(
            state
                .grants
                .values()
                .filter(|g| g.user_id == user_id && g.is_drawable(now)),
        );
        // Stable sort keeps creation order among equal window ends.
        grants.sort_by_key(|g| g.ends_at);
        Ok(grants)
    }

    async fn update_grant_status(&self, grant_id: &str, status: GrantStatus) -> Result<()> {
        let mut state = write(&self.inner.ledger)?;
        let grant = state
            .grants
            .get_mut(grant_id)
            .ok_or_else(|| LedgerLinkError::not_found("grant", grant_id))?;
        grant.status = status;
        if status == GrantStatus::Expired {
            grant.remaining_credits = 0;
        }
        Ok(())
    }

    async fn record_warning(&self, warning: &ReconciliationWarning) -> Result<()> {
        write(&self.inner.ledger)?.warnings.push(warning.clone());
        Ok(())
    }

    async fn list_warnings(&self, limit: usize) -> Result<Vec<ReconciliationWarning>> {
        let state = read(&self.inner.ledger)?;
        Ok(state.warnings.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn find_link_by_ref(&self, external_ref: &str) -> Result<Option<CustomerLink>> {
        let state = read(&self.inner.identity)?;
        Ok(state
            .links
            .iter()
            .find(|l| l.is_active() && l.external_ref == external_ref)
            .cloned())
    }

    async fn find_link_by_user(&self, user_id: &str) -> Result<Option<CustomerLink>> {
        let state = read(&self.inner.identity)?;
        Ok(state
            .links
            .iter()
            .find(|l| l.is_active() && l.user_id == user_id)
            .cloned())
    }

    async fn list_links_for_ref(&self, external_ref: &str) -> Result<Vec<CustomerLink>> {
        let state = read(&self.inner.identity)?;
        Ok(state
            .links
            .iter()
            .filter(|l| l.external_ref == external_ref)
            .cloned()
            .collect())
    }

    async fn create_link(&self, link: &CustomerLink) -> Result<LinkWrite> {
        let mut state = write(&self.inner.identity)?;

        if let Some(existing) = state
            .links
            .iter()
            .find(|l| l.is_active() && l.external_ref == link.external_ref)
        {
            if existing.user_id == link.user_id {
                return Ok(LinkWrite::AlreadyLinked(existing.clone()));
            }
            return Ok(LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy {
                user_id: existing.user_id.clone(),
            }));
        }
        if let Some(existing) = state
            .links
            .iter()
            .find(|l| l.is_active() && l.user_id == link.user_id)
        {
            return Ok(LinkWrite::Conflict(LinkOwner::UserLinkedTo {
                external_ref: existing.external_ref.clone(),
            }));
        }

        state.links.push(link.clone());
        Ok(LinkWrite::Created(link.clone()))
    }

    async fn replace_link(&self, superseded_id: &str, link: &CustomerLink) -> Result<LinkWrite> {
        let mut state = write(&self.inner.identity)?;

        let Some(index) = state
            .links
            .iter()
            .position(|l| l.id == superseded_id && l.is_active())
        else {
            return Err(LedgerLinkError::not_found("customer_link", superseded_id));
        };

        let others = state
            .links
            .iter()
            .filter(|l| l.is_active() && l.id != superseded_id);
        for other in others {
            if other.user_id == link.user_id {
                return Ok(LinkWrite::Conflict(LinkOwner::UserLinkedTo {
                    external_ref: other.external_ref.clone(),
                }));
            }
            if other.external_ref == link.external_ref {
                return Ok(LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy {
                    user_id: other.user_id.clone(),
                }));
            }
        }

        let superseded = &mut state.links[index];
        superseded.status = LinkStatus::Superseded;
        superseded.superseded_at = Some(Utc::now());
        state.links.push(link.clone());
        Ok(LinkWrite::Created(link.clone()))
    }

    async fn upsert_unresolved(&self, reference: &UnresolvedReference) -> Result<UnresolvedReference> {
        let mut state = write(&self.inner.identity)?;
        let entry = state
            .unresolved
            .entry(reference.external_ref.clone())
            .and_modify(|existing| existing.absorb(reference))
            .or_insert_with(|| reference.clone());
        Ok(entry.clone())
    }

    async fn get_unresolved(&self, external_ref: &str) -> Result<Option<UnresolvedReference>> {
        Ok(read(&self.inner.identity)?.unresolved.get(external_ref).cloned())
    }

    async fn list_unresolved(&self, status: UnresolvedStatus) -> Result<Vec<UnresolvedReference>> {
        let state = read(&self.inner.identity)?;
        let mut entries: Vec<UnresolvedReference> = state
            .unresolved
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.external_ref.cmp(&b.external_ref))
        });
        Ok(entries)
    }

    async fn mark_resolved(&self, external_ref: &str, user_id: &str) -> Result<bool> {
        let mut state = write(&self.inner.identity)?;
        match state.unresolved.get_mut(external_ref) {
            Some(entry) if entry.status == UnresolvedStatus::Pending => {
                let now = Utc::now();
                entry.status = UnresolvedStatus::Resolved;
                entry.resolved_at = Some(now);
                entry.resolved_user_id = Some(user_id.to_string());
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_abandoned(&self, external_ref: &str, note: Option<&str>) -> Result<bool> {
        let mut state = write(&self.inner.identity)?;
        match state.unresolved.get_mut(external_ref) {
            Some(entry) if entry.status == UnresolvedStatus::Pending => {
                entry.status = UnresolvedStatus::Abandoned;
                entry.note = note.map(String::from);
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn park_event(&self, event: &ParkedEvent) -> Result<bool> {
        let mut state = write(&self.inner.identity)?;
        if state.parked.iter().any(|p| p.event_key == event.event_key) {
            return Ok(false);
        }
        state.parked.push(event.clone());
        Ok(true)
    }

    async fn list_parked(&self, external_ref: &str) -> Result<Vec<ParkedEvent>> {
        let state = read(&self.inner.identity)?;
        let mut parked: Vec<ParkedEvent> = state
            .parked
            .iter()
            .filter(|p| p.external_ref == external_ref && p.status == ParkedStatus::Parked)
            .cloned()
            .collect();
        parked.sort_by_key(|p| p.parked_at);
        Ok(parked)
    }

    async fn mark_parked_replayed(&self, event_key: &str) -> Result<()> {
        let mut state = write(&self.inner.identity)?;
        if let Some(parked) = state
            .parked
            .iter_mut()
            .find(|p| p.event_key == event_key && p.status == ParkedStatus::Parked)
        {
            parked.status = ParkedStatus::Replayed;
            parked.replayed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<LocalUser>> {
        Ok(read(&self.inner.users)?.get(user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<LocalUser>> {
        let users = read(&self.inner.users)?;
        Ok(users
            .values()
            .filter(|u| u.email.as_deref().map(str::trim) == Some(email.trim()))
            .cloned()
            .collect())
    }

    async fn find_by_name_fragment(&self, name: &str) -> Result<Vec<LocalUser>> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let users = read(&self.inner.users)?;
        Ok(users
            .values()
            .filter(|u| {
                u.display_name.as_deref().map(normalize_name).is_some_and(|have| {
                    !have.is_empty() && (have.contains(&wanted) || wanted.contains(&have))
                })
            })
            .cloned()
            .collect())
    }

    async fn search_users(&self, query: &str, limit: usize) -> Result<Vec<LocalUser>> {
        let query = query.trim().to_lowercase();
        let users = read(&self.inner.users)?;
        Ok(users
            .values()
            .filter(|u| {
                query.is_empty()
                    || u.id.to_lowercase().contains(&query)
                    || u.email.as_deref().is_some_and(|e| e.to_lowercase().contains(&query))
                    || u.display_name
                        .as_deref()
                        .is_some_and(|n| n.to_lowercase().contains(&query))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AppliedEventStore for InMemoryStore {
    async fn get(&self, event_key: &str) -> Result<Option<AppliedEvent>> {
        Ok(read(&self.inner.applied)?.get(event_key).cloned())
    }

    async fn record(&self, event: AppliedEvent) -> Result<bool> {
        let mut applied = write(&self.inner.applied)?;
        if applied.contains_key(&event.event_key) {
            return Ok(false);
        }
        applied.insert(event.event_key.clone(), event);
        Ok(true)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let mut applied = write(&self.inner.applied)?;
        let before = applied.len();
        applied.retain(|_, e| e.applied_at >= cutoff);
        Ok((before - applied.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MatchStrategy, ReferenceContext};
    use crate::ledger::{GrantDraw, TransactionKind};
    use crate::reconciler::AppliedResult;

    fn grant(id: &str, user_id: &str, remaining: i64) -> CreditGrant {
        let now = Utc::now();
        CreditGrant {
            id: id.to_string(),
            user_id: user_id.to_string(),
            subscription_ref: format!("sub_{}", id),
            total_credits: remaining,
            remaining_credits: remaining,
            starts_at: now,
            ends_at: now + Duration::days(30),
            status: GrantStatus::Active,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_apply_refuses_negative_balance() {
        let store = InMemoryStore::new();
        let outcome = store
            .apply(LedgerMutation::new("user_1", -1, TransactionKind::Consumption, "x"))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Insufficient { .. }));
        assert!(store.list_transactions("user_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_rejects_overflowing_totals() {
        let store = InMemoryStore::new();
        store
            .apply(LedgerMutation::new("user_1", i64::MAX, TransactionKind::Bonus, "seed"))
            .await
            .unwrap();

        let err = store
            .apply(LedgerMutation::new("user_1", 1, TransactionKind::Bonus, "more"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerLinkError::Validation { field: "amount", .. }));
        assert_eq!(store.list_transactions("user_1").await.unwrap().len(), 1);
        assert_eq!(store.get_balance("user_1").await.unwrap().unwrap().balance, i64::MAX);

        // The store stays usable for everyone else.
        let outcome = store
            .apply(LedgerMutation::new("user_2", 5, TransactionKind::Bonus, "seed"))
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_apply_dedupes_per_user() {
        let store = InMemoryStore::new();
        let mutation = LedgerMutation::new("user_1", 5, TransactionKind::Bonus, "signup")
            .with_dedupe_key(Some("signup".to_string()));

        assert!(matches!(
            store.apply(mutation.clone()).await.unwrap(),
            ApplyOutcome::Applied { .. }
        ));
        assert!(matches!(
            store.apply(mutation).await.unwrap(),
            ApplyOutcome::Duplicate { .. }
        ));

        // Same key for another user is independent.
        let other = LedgerMutation::new("user_2", 5, TransactionKind::Bonus, "signup")
            .with_dedupe_key(Some("signup".to_string()));
        assert!(matches!(
            store.apply(other).await.unwrap(),
            ApplyOutcome::Applied { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_grant_effect_writes_nothing() {
        let store = InMemoryStore::new();
        store
            .apply(LedgerMutation::new("user_1", 10, TransactionKind::Bonus, "seed"))
            .await
            .unwrap();

        let mut bad = LedgerMutation::new("user_1", -3, TransactionKind::Consumption, "x");
        bad.grant_effect = Some(GrantEffect::Draw(vec![GrantDraw {
            grant_id: "missing".to_string(),
            amount: 3,
        }]));
        assert!(store.apply(bad).await.is_err());

        assert_eq!(store.get_balance("user_1").await.unwrap().unwrap().balance, 10);
        assert_eq!(store.list_transactions("user_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_grant_open_draw_close() {
        let store = InMemoryStore::new();
        let g = grant("g1", "user_1", 10);
        store
            .apply(
                LedgerMutation::new("user_1", 10, TransactionKind::Bonus, "grant")
                    .with_grant_effect("g1", GrantEffect::Open(g)),
            )
            .await
            .unwrap();

        let mut draw = LedgerMutation::new("user_1", -4, TransactionKind::Consumption, "use");
        draw.grant_effect = Some(GrantEffect::Draw(vec![GrantDraw {
            grant_id: "g1".to_string(),
            amount: 4,
        }]));
        store.apply(draw).await.unwrap();
        assert_eq!(store.get_grant("g1").await.unwrap().unwrap().remaining_credits, 6);

        store
            .update_grant_status("g1", GrantStatus::Expired)
            .await
            .unwrap();
        let closed = store.get_grant("g1").await.unwrap().unwrap();
        assert_eq!(closed.status, GrantStatus::Expired);
        assert_eq!(closed.remaining_credits, 0);
        assert!(store.list_drawable_grants("user_1", Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_uniqueness_both_directions() {
        let store = InMemoryStore::new();
        let link = CustomerLink::new("user_1", "cus_a", MatchStrategy::Email);
        assert!(matches!(store.create_link(&link).await.unwrap(), LinkWrite::Created(_)));

        let same = CustomerLink::new("user_1", "cus_a", MatchStrategy::Manual);
        assert!(matches!(
            store.create_link(&same).await.unwrap(),
            LinkWrite::AlreadyLinked(_)
        ));

        let claimed = CustomerLink::new("user_2", "cus_a", MatchStrategy::Manual);
        assert_eq!(
            store.create_link(&claimed).await.unwrap(),
            LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy {
                user_id: "user_1".to_string()
            })
        );

        let taken_user = CustomerLink::new("user_1", "cus_b", MatchStrategy::Manual);
        assert_eq!(
            store.create_link(&taken_user).await.unwrap(),
            LinkWrite::Conflict(LinkOwner::UserLinkedTo {
                external_ref: "cus_a".to_string()
            })
        );
        assert_eq!(store.list_links_for_ref("cus_b").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_replace_link_supersedes() {
        let store = InMemoryStore::new();
        let original = CustomerLink::new("user_1", "cus_a", MatchStrategy::Email);
        store.create_link(&original).await.unwrap();
        store
            .create_link(&CustomerLink::new("user_3", "cus_c", MatchStrategy::Email))
            .await
            .unwrap();

        let conflicting = CustomerLink::new("user_3", "cus_a", MatchStrategy::Manual);
        assert!(matches!(
            store.replace_link(&original.id, &conflicting).await.unwrap(),
            LinkWrite::Conflict(LinkOwner::UserLinkedTo { .. })
        ));

        let repaired = CustomerLink::new("user_2", "cus_a", MatchStrategy::Manual);
        assert!(matches!(
            store.replace_link(&original.id, &repaired).await.unwrap(),
            LinkWrite::Created(_)
        ));
        let active = store.find_link_by_ref("cus_a").await.unwrap().unwrap();
        assert_eq!(active.user_id, "user_2");
        assert!(store.find_link_by_user("user_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unresolved_transitions_are_one_way() {
        let store = InMemoryStore::new();
        let entry =
            UnresolvedReference::pending("cus_a", ReferenceContext::default(), "no_candidate", vec![]);
        store.upsert_unresolved(&entry).await.unwrap();
        let merged = store.upsert_unresolved(&entry).await.unwrap();
        assert_eq!(merged.attempts, 2);

        assert!(store.mark_abandoned("cus_a", Some("test account")).await.unwrap());
        assert!(!store.mark_resolved("cus_a", "user_1").await.unwrap());
        assert!(!store.mark_resolved("cus_missing", "user_1").await.unwrap());

        let stored = store.get_unresolved("cus_a").await.unwrap().unwrap();
        assert_eq!(stored.status, UnresolvedStatus::Abandoned);
        assert_eq!(stored.note.as_deref(), Some("test account"));
    }

    #[tokio::test]
    async fn test_user_directory_queries() {
        let store = InMemoryStore::new();
        store.add_user("user_1", Some("jane@example.com"), Some("Jane Doe"));
        store.add_user("user_2", Some("john@example.com"), Some("John Doe"));

        assert_eq!(store.find_by_email("jane@example.com").await.unwrap().len(), 1);
        assert_eq!(store.find_by_name_fragment("  doe ").await.unwrap().len(), 2);
        assert_eq!(store.find_by_name_fragment("JANE DOE").await.unwrap().len(), 1);
        assert_eq!(store.search_users("EXAMPLE", 1).await.unwrap().len(), 1);
        assert_eq!(store.search_users("john", 10).await.unwrap()[0].id, "user_2");
    }

    #[tokio::test]
    async fn test_applied_event_record_is_first_writer_wins() {
        let store = InMemoryStore::new();
        assert!(store
            .record(AppliedEvent::new("evt_1", "invoice_paid", AppliedResult::Ignored))
            .await
            .unwrap());
        assert!(!store
            .record(AppliedEvent::new("evt_1", "other", AppliedResult::Ignored))
            .await
            .unwrap());
        assert_eq!(
            store.get("evt_1").await.unwrap().unwrap().event_type,
            "invoice_paid"
        );
        assert_eq!(store.cleanup_older_than(1).await.unwrap(), 0);
    }
}
