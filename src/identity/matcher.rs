//! Identity matcher.
//!
//! Resolves an external customer reference to exactly one local user:
//!
//! 1. an existing customer link (exact)
//! 2. a local user id in the processor customer's metadata (high)
//! 3. exact email equality (medium)
//! 4. normalized display-name equality or containment (low)
//!
//! The processor lookup happens once, before any lock is taken. Link creation is
//! serialized per reference and per user; the first writer wins and later
//! writers observe its link. Once a link exists, events parked for the
//! reference are replayed through [`PendingReplay`].

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::processor::{CustomerDirectory, ProcessorCustomer, local_user_id_from};
use super::store::{
    CustomerLink, IdentityStore, LinkWrite, ReferenceContext, UnresolvedReference, UserDirectory,
};
use super::strategies::{Confidence, MatchEvidence, MatchStrategy, StrategyResult, run_strategies};
use crate::audit::{AuditLogger, ReconcileAuditEvent, TracingAuditLogger};
use crate::config::MatchingConfig;
use crate::error::{LedgerLinkError, LinkOwner, Result};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::retry::{RetryPolicy, with_retry};

/// Whatever the triggering event said about the payer.
///
/// Used when the processor record lacks a field, and kept as diagnosis context
/// on the unresolved queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ContextHints {
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn to_context(&self) -> ReferenceContext {
        ReferenceContext {
            subscription_ref: self.subscription_ref.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            event_type: self.event_type.clone(),
            metadata: self.metadata.clone(),
            observed_at: Some(Utc::now()),
        }
    }
}

impl From<&ReferenceContext> for ContextHints {
    fn from(context: &ReferenceContext) -> Self {
        Self {
            email: context.email.clone(),
            name: context.name.clone(),
            subscription_ref: context.subscription_ref.clone(),
            event_type: context.event_type.clone(),
            metadata: context.metadata.clone(),
        }
    }
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedUser {
    pub user_id: String,
    pub strategy: MatchStrategy,
    pub confidence: Confidence,
    /// This call created the link.
    pub link_created: bool,
    /// Parked events applied as a result of this call.
    pub replayed: usize,
    /// Parked events that could not be applied and are still parked.
    pub replay_failed: usize,
}

impl MatchedUser {
    /// Whether every parked event for the reference went through.
    #[must_use]
    pub fn is_fully_replayed(&self) -> bool {
        self.replay_failed == 0
    }
}

/// Why a reference could not be matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// No strategy found a candidate.
    NoCandidate,
    /// Several users qualified equally.
    Ambiguous {
        strategy: MatchStrategy,
        candidates: Vec<String>,
    },
    /// A candidate was found but below the auto-link threshold.
    BelowConfidence {
        strategy: MatchStrategy,
        candidate: String,
    },
    /// The candidate is already linked to another reference.
    LinkConflict { existing: LinkOwner },
}

impl UnresolvedReason {
    /// Short code stored on the unresolved queue.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCandidate => "no_candidate",
            Self::Ambiguous { .. } => "ambiguous",
            Self::BelowConfidence { .. } => "below_confidence",
            Self::LinkConflict { .. } => "link_conflict",
        }
    }

    fn candidates(&self) -> Vec<String> {
        match self {
            Self::NoCandidate => Vec::new(),
            Self::Ambiguous { candidates, .. } => candidates.clone(),
            Self::BelowConfidence { candidate, .. } => vec![candidate.clone()],
            Self::LinkConflict { existing } => match existing {
                LinkOwner::ReferenceClaimedBy { user_id } => vec![user_id.clone()],
                LinkOwner::UserLinkedTo { .. } => Vec::new(),
            },
        }
    }
}

/// Result of [`IdentityMatcher::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Matched(MatchedUser),
    Unresolved { reason: UnresolvedReason },
}

impl Resolution {
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Matched(m) => Some(&m.user_id),
            Self::Unresolved { .. } => None,
        }
    }
}

/// Summary of one replay pass over parked events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Applies events parked for a reference once it is linked to a user.
#[async_trait]
pub trait PendingReplay: Send + Sync {
    async fn replay(&self, external_ref: &str, user_id: &str) -> Result<ReplaySummary>;
}

/// Per-reference result of [`IdentityMatcher::batch_resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub external_ref: String,
    #[serde(flatten)]
    pub outcome: BatchItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Matched(MatchedUser),
    Unresolved { reason: UnresolvedReason },
    Failed { code: String, message: String },
}

/// Report for a batch match. One entry per input reference, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    pub matched: usize,
    pub unresolved: usize,
    pub failed: usize,
    /// Matched references that still have parked events left unapplied.
    pub replay_incomplete: usize,
}

/// Resolves external customer references to local users.
pub struct IdentityMatcher<S: IdentityStore> {
    store: Arc<S>,
    users: Arc<dyn UserDirectory>,
    customers: Arc<dyn CustomerDirectory>,
    retry: RetryPolicy,
    config: MatchingConfig,
    locks: KeyedLocks,
    audit: Arc<dyn AuditLogger>,
    replay: Option<Arc<dyn PendingReplay>>,
}

impl<S: IdentityStore> Clone for IdentityMatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            users: self.users.clone(),
            customers: self.customers.clone(),
            retry: self.retry.clone(),
            config: self.config.clone(),
            locks: self.locks.clone(),
            audit: self.audit.clone(),
            replay: self.replay.clone(),
        }
    }
}

impl<S: IdentityStore> IdentityMatcher<S> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        users: Arc<dyn UserDirectory>,
        customers: Arc<dyn CustomerDirectory>,
    ) -> Self {
        Self {
            store,
            users,
            customers,
            retry: RetryPolicy::default(),
            config: MatchingConfig::default(),
            locks: KeyedLocks::new(),
            audit: Arc::new(TracingAuditLogger),
            replay: None,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: MatchingConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Replay parked events through `replay` whenever a reference gets linked.
    #[must_use]
    pub fn with_replay(mut self, replay: Arc<dyn PendingReplay>) -> Self {
        self.replay = Some(replay);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.users
    }

    /// Resolve a reference to a local user.
    ///
    /// On exhaustion the reference is queued as unresolved with a context
    /// snapshot. Upstream failures are queued the same way and then returned
    /// as errors, so the caller can park the triggering event.
    pub async fn resolve(&self, external_ref: &str, hints: &ContextHints) -> Result<Resolution> {
        validate_ref(external_ref)?;
        let _order = self.lock_reference(external_ref).await;
        self.resolve_in_order(external_ref, hints).await
    }

    /// Serialize event handling and parked-event replay for one reference.
    ///
    /// Held for the whole of a reconcile, a manual match or a repair, so a
    /// live event never overtakes events still being replayed.
    pub async fn lock_reference(&self, external_ref: &str) -> KeyedGuard {
        self.locks.lock(&format!("order:{}", external_ref)).await
    }

    /// [`resolve`](Self::resolve) for a caller already holding
    /// [`lock_reference`](Self::lock_reference).
    pub(crate) async fn resolve_in_order(
        &self,
        external_ref: &str,
        hints: &ContextHints,
    ) -> Result<Resolution> {
        validate_ref(external_ref)?;

        if let Some(link) = self.store.find_link_by_ref(external_ref).await? {
            debug!(
                target: "ledgerlink::identity",
                external_ref = external_ref,
                user_id = %link.user_id,
                "Resolved by direct link"
            );
            // Events left parked by an earlier failed replay go first.
            let summary = if self.store.list_parked(external_ref).await?.is_empty() {
                ReplaySummary::default()
            } else {
                self.replay_and_resolve(external_ref, &link.user_id).await?
            };
            return Ok(Resolution::Matched(MatchedUser {
                user_id: link.user_id,
                strategy: MatchStrategy::DirectLink,
                confidence: Confidence::Exact,
                link_created: false,
                replayed: summary.replayed,
                replay_failed: summary.failed,
            }));
        }

        // No locks held while talking to the processor.
        let customers = self.customers.clone();
        let fetched = with_retry(&self.retry, "fetch_customer", || {
            let customers = customers.clone();
            let external_ref = external_ref.to_string();
            async move { customers.fetch_customer(&external_ref).await }
        })
        .await;

        let customer = match fetched {
            Ok(customer) => customer,
            Err(e) if e.is_upstream() => {
                warn!(
                    target: "ledgerlink::identity",
                    external_ref = external_ref,
                    error = %e,
                    "Processor lookup failed, queueing reference"
                );
                self.queue_unresolved(
                    external_ref,
                    hints.to_context(),
                    "upstream_unavailable",
                    Vec::new(),
                )
                .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let evidence = self.gather_evidence(external_ref, customer.as_ref(), hints).await?;
        let mut context = hints.to_context();
        if let Some(customer) = &customer {
            context.merge(&customer_context(customer));
        }

        let reason = match run_strategies(&evidence) {
            StrategyResult::Matched { user_id, strategy } => {
                if strategy.confidence() < self.config.min_auto_link_confidence {
                    UnresolvedReason::BelowConfidence {
                        strategy,
                        candidate: user_id,
                    }
                } else {
                    match self.link_automatically(external_ref, &user_id, strategy).await? {
                        Ok(matched) => return Ok(Resolution::Matched(matched)),
                        Err(reason) => reason,
                    }
                }
            }
            StrategyResult::Ambiguous {
                strategy,
                candidates,
            } => UnresolvedReason::Ambiguous {
                strategy,
                candidates,
            },
            StrategyResult::NoMatch => UnresolvedReason::NoCandidate,
        };

        self.queue_unresolved(external_ref, context, reason.code(), reason.candidates())
            .await?;
        Ok(Resolution::Unresolved { reason })
    }

    /// Link a reference to a user chosen by an operator.
    ///
    /// Fails with `NotFound` if the user does not exist and with `Conflict` if
    /// either side is already linked elsewhere. Linking the same pair twice is a
    /// no-op that still replays anything left parked.
    pub async fn manual_match(
        &self,
        external_ref: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> Result<MatchedUser> {
        validate_ref(external_ref)?;
        if self.users.get_user(user_id).await?.is_none() {
            return Err(LedgerLinkError::not_found("user", user_id));
        }

        let _order = self.lock_reference(external_ref).await;
        let link = CustomerLink::new(user_id, external_ref, MatchStrategy::Manual)
            .with_note(note.map(String::from));

        let link_created = {
            let _guards = self.lock_link(external_ref, user_id).await;
            match self.store.create_link(&link).await? {
                LinkWrite::Created(_) => true,
                LinkWrite::AlreadyLinked(_) => false,
                LinkWrite::Conflict(existing) => {
                    return Err(LedgerLinkError::Conflict {
                        external_ref: external_ref.to_string(),
                        user_id: user_id.to_string(),
                        existing,
                    });
                }
            }
        };

        if link_created {
            info!(
                target: "ledgerlink::identity",
                external_ref = external_ref,
                user_id = user_id,
                "Manual match linked reference"
            );
            self.audit
                .log(ReconcileAuditEvent::LinkCreated {
                    external_ref: external_ref.to_string(),
                    user_id: user_id.to_string(),
                    strategy: MatchStrategy::Manual.to_string(),
                    confidence: Confidence::Exact.to_string(),
                })
                .await;
        }

        let summary = self.replay_and_resolve(external_ref, user_id).await?;
        Ok(MatchedUser {
            user_id: user_id.to_string(),
            strategy: MatchStrategy::Manual,
            confidence: Confidence::Exact,
            link_created,
            replayed: summary.replayed,
            replay_failed: summary.failed,
        })
    }

    /// Resolve many references independently.
    ///
    /// Hints come from each reference's queued context. One failure never
    /// affects the others.
    pub async fn batch_resolve(&self, external_refs: &[String]) -> BatchReport {
        let concurrency = self.config.batch_concurrency.max(1);

        let items: Vec<BatchItem> = stream::iter(external_refs.iter().cloned())
            .map(|external_ref| async move {
                let outcome = match self.resolve_queued(&external_ref).await {
                    Ok(Resolution::Matched(matched)) => BatchItemOutcome::Matched(matched),
                    Ok(Resolution::Unresolved { reason }) => BatchItemOutcome::Unresolved { reason },
                    Err(e) => BatchItemOutcome::Failed {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                };
                BatchItem {
                    external_ref,
                    outcome,
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for item in &items {
            match &item.outcome {
                BatchItemOutcome::Matched(matched) => {
                    report.matched += 1;
                    if !matched.is_fully_replayed() {
                        report.replay_incomplete += 1;
                    }
                }
                BatchItemOutcome::Unresolved { .. } => report.unresolved += 1,
                BatchItemOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report.items = items;

        info!(
            target: "ledgerlink::identity",
            total = report.items.len(),
            matched = report.matched,
            unresolved = report.unresolved,
            failed = report.failed,
            replay_incomplete = report.replay_incomplete,
            "Batch match finished"
        );
        report
    }

    /// Re-point a reference's link to another user.
    ///
    /// The old link is kept as superseded. Fails with `NotFound` if the
    /// reference has no link or the user does not exist, and with `Conflict`
    /// if the user is already linked to a different reference.
    pub async fn repair_link(
        &self,
        external_ref: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> Result<MatchedUser> {
        validate_ref(external_ref)?;
        if self.users.get_user(user_id).await?.is_none() {
            return Err(LedgerLinkError::not_found("user", user_id));
        }

        let _order = self.lock_reference(external_ref).await;
        let previous_user_id = {
            let _guards = self.lock_link(external_ref, user_id).await;
            let existing = self
                .store
                .find_link_by_ref(external_ref)
                .await?
                .ok_or_else(|| LedgerLinkError::not_found("customer_link", external_ref))?;

            if existing.user_id == user_id {
                return Ok(MatchedUser {
                    user_id: user_id.to_string(),
                    strategy: existing.strategy,
                    confidence: existing.confidence,
                    link_created: false,
                    replayed: 0,
                    replay_failed: 0,
                });
            }

            let link = CustomerLink::new(user_id, external_ref, MatchStrategy::Manual)
                .with_note(note.map(String::from));
            match self.store.replace_link(&existing.id, &link).await? {
                LinkWrite::Created(_) | LinkWrite::AlreadyLinked(_) => existing.user_id,
                LinkWrite::Conflict(owner) => {
                    return Err(LedgerLinkError::Conflict {
                        external_ref: external_ref.to_string(),
                        user_id: user_id.to_string(),
                        existing: owner,
                    });
                }
            }
        };

        warn!(
            target: "ledgerlink::identity",
            external_ref = external_ref,
            previous_user_id = %previous_user_id,
            user_id = user_id,
            "Customer link repaired"
        );
        self.audit
            .log(ReconcileAuditEvent::LinkRepaired {
                external_ref: external_ref.to_string(),
                previous_user_id,
                user_id: user_id.to_string(),
                note: note.map(String::from),
            })
            .await;

        let summary = self.replay_and_resolve(external_ref, user_id).await?;
        Ok(MatchedUser {
            user_id: user_id.to_string(),
            strategy: MatchStrategy::Manual,
            confidence: Confidence::Exact,
            link_created: true,
            replayed: summary.replayed,
            replay_failed: summary.failed,
        })
    }

    /// Move a pending reference to abandoned. Parked events stay stored.
    pub async fn abandon(&self, external_ref: &str, note: Option<&str>) -> Result<bool> {
        validate_ref(external_ref)?;
        let abandoned = self.store.mark_abandoned(external_ref, note).await?;
        if abandoned {
            self.audit
                .log(ReconcileAuditEvent::ReferenceAbandoned {
                    external_ref: external_ref.to_string(),
                    note: note.map(String::from),
                })
                .await;
        }
        Ok(abandoned)
    }

    /// Fetch the processor-side customer for operator diagnosis.
    pub async fn fetch_customer(&self, external_ref: &str) -> Result<Option<ProcessorCustomer>> {
        validate_ref(external_ref)?;
        let customers = self.customers.clone();
        with_retry(&self.retry, "fetch_customer", || {
            let customers = customers.clone();
            let external_ref = external_ref.to_string();
            async move { customers.fetch_customer(&external_ref).await }
        })
        .await
    }

    /// Resolve a reference using the context stored on its unresolved entry.
    pub async fn resolve_queued(&self, external_ref: &str) -> Result<Resolution> {
        let hints = self
            .store
            .get_unresolved(external_ref)
            .await?
            .map(|r| ContextHints::from(&r.context))
            .unwrap_or_default();
        self.resolve(external_ref, &hints).await
    }

    /// Create the link for an automatic match.
    ///
    /// The outer error is a storage failure; the inner one means the match
    /// must be reported as unresolved.
    async fn link_automatically(
        &self,
        external_ref: &str,
        user_id: &str,
        strategy: MatchStrategy,
    ) -> Result<std::result::Result<MatchedUser, UnresolvedReason>> {
        let link = CustomerLink::new(user_id, external_ref, strategy);

        let write = {
            let _guards = self.lock_link(external_ref, user_id).await;
            self.store.create_link(&link).await?
        };

        let (user_id, strategy, link_created) = match write {
            LinkWrite::Created(link) => {
                info!(
                    target: "ledgerlink::identity",
                    external_ref = external_ref,
                    user_id = %link.user_id,
                    strategy = %strategy,
                    "Linked reference to user"
                );
                self.audit
                    .log(ReconcileAuditEvent::LinkCreated {
                        external_ref: external_ref.to_string(),
                        user_id: link.user_id.clone(),
                        strategy: strategy.to_string(),
                        confidence: link.confidence.to_string(),
                    })
                    .await;
                (link.user_id, strategy, true)
            }
            LinkWrite::AlreadyLinked(link) => (link.user_id, MatchStrategy::DirectLink, false),
            LinkWrite::Conflict(LinkOwner::ReferenceClaimedBy { .. }) => {
                // Another resolution won the race; observe its link.
                match self.store.find_link_by_ref(external_ref).await? {
                    Some(link) => (link.user_id, MatchStrategy::DirectLink, false),
                    None => {
                        return Err(LedgerLinkError::internal(format!(
                            "link for {} reported claimed but not found",
                            external_ref
                        )));
                    }
                }
            }
            LinkWrite::Conflict(existing) => {
                warn!(
                    target: "ledgerlink::identity",
                    external_ref = external_ref,
                    user_id = user_id,
                    existing = %existing,
                    "Candidate already linked elsewhere"
                );
                return Ok(Err(UnresolvedReason::LinkConflict { existing }));
            }
        };

        let summary = if link_created {
            self.replay_and_resolve(external_ref, &user_id).await?
        } else {
            ReplaySummary::default()
        };

        Ok(Ok(MatchedUser {
            confidence: strategy.confidence(),
            user_id,
            strategy,
            link_created,
            replayed: summary.replayed,
            replay_failed: summary.failed,
        }))
    }

    /// Replay parked events and, if all of them went through, resolve the queue entry.
    ///
    /// Callers hold [`lock_reference`](Self::lock_reference).
    async fn replay_and_resolve(&self, external_ref: &str, user_id: &str) -> Result<ReplaySummary> {
        let summary = match &self.replay {
            Some(replay) => replay
                .replay(external_ref, user_id)
                .await
                .inspect_err(|e| {
                    warn!(
                        target: "ledgerlink::identity",
                        external_ref = external_ref,
                        user_id = user_id,
                        error = %e,
                        "Replay of parked events failed"
                    );
                })?,
            None => ReplaySummary::default(),
        };

        if summary.failed == 0 {
            self.store.mark_resolved(external_ref, user_id).await?;
        } else {
            warn!(
                target: "ledgerlink::identity",
                external_ref = external_ref,
                user_id = user_id,
                failed = summary.failed,
                "Parked events left unapplied, reference stays pending"
            );
        }
        Ok(summary)
    }

    async fn queue_unresolved(
        &self,
        external_ref: &str,
        context: ReferenceContext,
        reason: &str,
        candidates: Vec<String>,
    ) -> Result<()> {
        let entry = UnresolvedReference::pending(external_ref, context, reason, candidates);
        let stored = self.store.upsert_unresolved(&entry).await?;
        info!(
            target: "ledgerlink::identity",
            external_ref = external_ref,
            reason = reason,
            attempts = stored.attempts,
            "Reference unresolved"
        );
        self.audit
            .log(ReconcileAuditEvent::ReferenceUnresolved {
                external_ref: external_ref.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }

    async fn gather_evidence(
        &self,
        external_ref: &str,
        customer: Option<&ProcessorCustomer>,
        hints: &ContextHints,
    ) -> Result<MatchEvidence> {
        let mut metadata = hints.metadata.clone();
        if let Some(customer) = customer {
            metadata.extend(customer.metadata.clone());
        }
        let metadata_user_id = local_user_id_from(&metadata).map(String::from);

        let email = customer
            .and_then(|c| c.email.clone())
            .or_else(|| hints.email.clone())
            .filter(|e| !e.trim().is_empty());
        let name = customer
            .and_then(|c| c.name.clone())
            .or_else(|| hints.name.clone())
            .filter(|n| !n.trim().is_empty());

        let metadata_user = match &metadata_user_id {
            Some(id) => self.users.get_user(id).await?,
            None => None,
        };
        let email_matches = match &email {
            Some(email) => self.users.find_by_email(email.trim()).await?,
            None => Vec::new(),
        };
        let name_candidates = match &name {
            Some(name) => self.users.find_by_name_fragment(name).await?,
            None => Vec::new(),
        };

        Ok(MatchEvidence {
            external_ref: external_ref.to_string(),
            metadata_user_id,
            metadata_user,
            email,
            email_matches,
            name,
            name_candidates,
        })
    }

    async fn lock_link(
        &self,
        external_ref: &str,
        user_id: &str,
    ) -> (KeyedGuard, Option<KeyedGuard>) {
        self.locks
            .lock_pair(&format!("ref:{}", external_ref), &format!("user:{}", user_id))
            .await
    }
}

fn customer_context(customer: &ProcessorCustomer) -> ReferenceContext {
    ReferenceContext {
        email: customer.email.clone(),
        name: customer.name.clone(),
        metadata: customer.metadata.clone(),
        ..ReferenceContext::default()
    }
}

fn validate_ref(external_ref: &str) -> Result<()> {
    if external_ref.trim().is_empty() {
        return Err(LedgerLinkError::validation(
            "external_ref",
            "must not be empty",
        ));
    }
    Ok(())
}
