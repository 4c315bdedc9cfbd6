//! Admin reconciliation commands.

use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::types::{
    Abandoned, AdminResult, BalanceReport, Consumed, CustomerInfo, PendingReference,
    PendingUnresolved, TransactionList, UserSearch, WarningList,
};
use crate::error::{LedgerLinkError, Result};
use crate::identity::{
    BatchReport, IdentityMatcher, IdentityStore, MatchedUser, Resolution, UnresolvedReason,
    UnresolvedStatus,
};
use crate::ledger::{BonusRequest, ConsumeOutcome, CreditLedger, GrantOutcome, LedgerStore};
use crate::reconciler::EventReconciler;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_WARNING_LIMIT: usize = 50;

/// Operator commands over a running reconciler.
///
/// Every command returns an [`AdminResult`]. Expected failures (conflict,
/// ambiguity, unknown user, insufficient balance) come back as
/// `success: false` with a reason code, never as a bare error.
pub struct ReconciliationAdmin<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    reconciler: Arc<EventReconciler<L, I>>,
}

impl<L, I> Clone for ReconciliationAdmin<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<L, I> ReconciliationAdmin<L, I>
where
    L: LedgerStore + 'static,
    I: IdentityStore + 'static,
{
    #[must_use]
    pub fn new(reconciler: Arc<EventReconciler<L, I>>) -> Self {
        Self { reconciler }
    }

    fn matcher(&self) -> &IdentityMatcher<I> {
        self.reconciler.matcher()
    }

    fn ledger(&self) -> &CreditLedger<L> {
        self.reconciler.applier().ledger()
    }

    /// `GET pending-unresolved`
    pub async fn pending_unresolved(&self) -> AdminResult<PendingUnresolved> {
        respond("pending_unresolved", async {
            let identity = self.matcher().store();
            let pending = identity.list_unresolved(UnresolvedStatus::Pending).await?;

            let mut references = Vec::with_capacity(pending.len());
            for reference in pending {
                let parked_events = identity.list_parked(&reference.external_ref).await?.len();
                references.push(PendingReference {
                    reference,
                    parked_events,
                });
            }
            Ok(PendingUnresolved { references })
        })
        .await
    }

    /// `GET customer-info(ref)`
    ///
    /// A processor outage does not fail the command; the local state is still
    /// returned with `processor_error` set.
    pub async fn customer_info(&self, external_ref: &str) -> AdminResult<CustomerInfo> {
        respond("customer_info", async {
            require("external_ref", external_ref)?;
            let identity = self.matcher().store();

            let (processor, processor_error) = match self.matcher().fetch_customer(external_ref).await
            {
                Ok(customer) => (customer, None),
                Err(e) if e.is_upstream() => (None, Some(e.to_string())),
                Err(e) => return Err(e),
            };

            Ok(CustomerInfo {
                external_ref: external_ref.to_string(),
                link: identity.find_link_by_ref(external_ref).await?,
                link_history: identity.list_links_for_ref(external_ref).await?,
                unresolved: identity.get_unresolved(external_ref).await?,
                parked_events: identity.list_parked(external_ref).await?,
                processor,
                processor_error,
            })
        })
        .await
    }

    /// `GET search-users(query)`
    pub async fn search_users(&self, query: &str, limit: Option<usize>) -> AdminResult<UserSearch> {
        respond("search_users", async {
            let limit = limit
                .unwrap_or(DEFAULT_SEARCH_LIMIT)
                .clamp(1, MAX_SEARCH_LIMIT);
            let users = self.matcher().users().search_users(query, limit).await?;
            Ok(UserSearch {
                query: query.to_string(),
                users,
            })
        })
        .await
    }

    /// `POST manual-match(ref, userId, note)`
    pub async fn manual_match(
        &self,
        external_ref: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> AdminResult<MatchedUser> {
        let matched = async {
            require("user_id", user_id)?;
            self.matcher().manual_match(external_ref, user_id, note).await
        }
        .await;

        match matched {
            Ok(matched) => {
                info!(
                    target: "ledgerlink::admin",
                    external_ref = external_ref,
                    user_id = user_id,
                    replayed = matched.replayed,
                    replay_failed = matched.replay_failed,
                    "Manual match completed"
                );
                replay_checked("manual_match", external_ref, matched)
            }
            Err(e) => failure("manual_match", &e),
        }
    }

    /// `POST batch-match(refs[])`
    ///
    /// Succeeds once every reference was attempted; per-reference outcomes are
    /// in the report.
    pub async fn batch_match(&self, external_refs: &[String]) -> AdminResult<BatchReport> {
        respond("batch_match", async {
            if external_refs.is_empty() {
                return Err(LedgerLinkError::validation(
                    "external_refs",
                    "at least one reference is required",
                ));
            }
            let report = self.matcher().batch_resolve(external_refs).await;
            info!(
                target: "ledgerlink::admin",
                matched = report.matched,
                unresolved = report.unresolved,
                failed = report.failed,
                replay_incomplete = report.replay_incomplete,
                "Batch match completed"
            );
            Ok(report)
        })
        .await
    }

    /// `POST retry-match(ref)`: rerun automatic matching for one queued reference.
    pub async fn retry_match(&self, external_ref: &str) -> AdminResult<MatchedUser> {
        let resolution = match self.matcher().resolve_queued(external_ref).await {
            Ok(resolution) => resolution,
            Err(e) => return failure("retry_match", &e),
        };
        match resolution {
            Resolution::Matched(matched) => replay_checked("retry_match", external_ref, matched),
            Resolution::Unresolved { reason } => unresolved_result(external_ref, reason),
        }
    }

    /// `POST repair-link(ref, userId, note)`
    pub async fn repair_link(
        &self,
        external_ref: &str,
        user_id: &str,
        note: Option<&str>,
    ) -> AdminResult<MatchedUser> {
        let repaired = async {
            require("user_id", user_id)?;
            self.matcher().repair_link(external_ref, user_id, note).await
        }
        .await;

        match repaired {
            Ok(matched) => replay_checked("repair_link", external_ref, matched),
            Err(e) => failure("repair_link", &e),
        }
    }

    /// `POST abandon-reference(ref, note)`
    pub async fn abandon_reference(
        &self,
        external_ref: &str,
        note: Option<&str>,
    ) -> AdminResult<Abandoned> {
        let identity = self.matcher().store();
        let current = match identity.get_unresolved(external_ref).await {
            Ok(Some(reference)) => reference,
            Ok(None) => {
                return failure(
                    "abandon_reference",
                    &LedgerLinkError::not_found("unresolved_reference", external_ref),
                );
            }
            Err(e) => return failure("abandon_reference", &e),
        };
        if current.status != UnresolvedStatus::Pending {
            return not_pending(external_ref, current.status);
        }

        match self.matcher().abandon(external_ref, note).await {
            Ok(true) => {}
            // Resolved or abandoned by someone else since the read above.
            Ok(false) => {
                let status = identity
                    .get_unresolved(external_ref)
                    .await
                    .ok()
                    .flatten()
                    .map_or(UnresolvedStatus::Resolved, |r| r.status);
                return not_pending(external_ref, status);
            }
            Err(e) => return failure("abandon_reference", &e),
        }

        respond("abandon_reference", async {
            let parked_events = identity.list_parked(external_ref).await?.len();
            info!(
                target: "ledgerlink::admin",
                external_ref = external_ref,
                parked_events = parked_events,
                "Reference abandoned"
            );
            Ok(Abandoned {
                external_ref: external_ref.to_string(),
                parked_events,
            })
        })
        .await
    }

    /// `POST grant-bonus(userId, amount, reason)`
    pub async fn grant_bonus(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        dedupe_key: Option<&str>,
    ) -> AdminResult<GrantOutcome> {
        respond("grant_bonus", async {
            self.require_user(user_id).await?;
            let mut request = BonusRequest::new(user_id, amount, reason);
            if let Some(key) = dedupe_key {
                request = request.with_dedupe_key(key);
            }
            self.ledger().grant_bonus(request).await
        })
        .await
    }

    /// `POST consume(userId, amount, description)`
    pub async fn consume(&self, user_id: &str, amount: i64, description: &str) -> AdminResult<Consumed> {
        let outcome = async {
            self.require_user(user_id).await?;
            self.ledger().consume(user_id, amount, description).await
        }
        .await;

        match outcome {
            Ok(ConsumeOutcome::Consumed {
                balance,
                consumed,
                transaction_id,
            }) => AdminResult::ok(Consumed {
                balance,
                consumed,
                transaction_id,
            }),
            Ok(ConsumeOutcome::InsufficientBalance { balance, required }) => AdminResult::failed(
                "insufficient_balance",
                format!("balance {} is less than the {} credits required", balance, required),
            )
            .with_details(json!({ "balance": balance, "required": required })),
            Err(e) => failure("consume", &e),
        }
    }

    /// `GET reconciliation-warnings`, newest first.
    pub async fn reconciliation_warnings(&self, limit: Option<usize>) -> AdminResult<WarningList> {
        respond("reconciliation_warnings", async {
            let limit = limit.unwrap_or(DEFAULT_WARNING_LIMIT);
            let warnings = self.ledger().store().list_warnings(limit).await?;
            Ok(WarningList { warnings })
        })
        .await
    }

    /// `GET balance(userId)`, with grants and a consistency check.
    pub async fn balance(&self, user_id: &str) -> AdminResult<BalanceReport> {
        respond("balance", async {
            let balance = self.ledger().balance(user_id).await?;
            let grants = self.ledger().store().list_grants(user_id).await?;
            let verification = self.ledger().verify(user_id).await?;
            Ok(BalanceReport {
                balance,
                grants,
                verification,
            })
        })
        .await
    }

    /// `GET transactions(userId)`, oldest first.
    pub async fn transactions(&self, user_id: &str) -> AdminResult<TransactionList> {
        respond("transactions", async {
            let transactions = self.ledger().history(user_id).await?;
            Ok(TransactionList {
                user_id: user_id.to_string(),
                transactions,
            })
        })
        .await
    }

    async fn require_user(&self, user_id: &str) -> Result<()> {
        require("user_id", user_id)?;
        match self.matcher().users().get_user(user_id).await? {
            Some(_) => Ok(()),
            None => Err(LedgerLinkError::not_found("user", user_id)),
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerLinkError::validation(field, "must not be empty"));
    }
    Ok(())
}

async fn respond<T>(command: &'static str, fut: impl Future<Output = Result<T>>) -> AdminResult<T> {
    match fut.await {
        Ok(data) => AdminResult::ok(data),
        Err(e) => failure(command, &e),
    }
}

fn failure<T>(command: &'static str, err: &LedgerLinkError) -> AdminResult<T> {
    if err.is_client_error() {
        warn!(target: "ledgerlink::admin", command = command, code = err.code(), error = %err, "Admin command rejected");
    } else {
        error!(target: "ledgerlink::admin", command = command, code = err.code(), error = %err, "Admin command failed");
    }
    AdminResult::from_error(err)
}

/// A link whose replay left events parked is reported as a failure, with the
/// match itself still attached.
fn replay_checked(command: &'static str, external_ref: &str, matched: MatchedUser) -> AdminResult<MatchedUser> {
    if matched.is_fully_replayed() {
        return AdminResult::ok(matched);
    }
    warn!(
        target: "ledgerlink::admin",
        command = command,
        external_ref = external_ref,
        replay_failed = matched.replay_failed,
        "Parked events left unapplied"
    );
    let mut result = AdminResult::failed(
        "replay_incomplete",
        format!(
            "{} parked event(s) for '{}' could not be applied",
            matched.replay_failed, external_ref
        ),
    )
    .with_details(json!({
        "external_ref": external_ref,
        "user_id": matched.user_id,
        "replayed": matched.replayed,
        "replay_failed": matched.replay_failed,
    }));
    result.data = Some(matched);
    result
}

fn not_pending<T>(external_ref: &str, status: UnresolvedStatus) -> AdminResult<T> {
    AdminResult::failed(
        "not_pending",
        format!("reference '{}' is {}, not pending", external_ref, status.as_str()),
    )
    .with_details(json!({ "external_ref": external_ref, "status": status.as_str() }))
}

fn unresolved_result<T>(external_ref: &str, reason: UnresolvedReason) -> AdminResult<T> {
    match reason {
        UnresolvedReason::Ambiguous { candidates, .. } => AdminResult::from_error(
            &LedgerLinkError::AmbiguousMatch {
                external_ref: external_ref.to_string(),
                candidates,
            },
        ),
        UnresolvedReason::LinkConflict { existing } => {
            AdminResult::failed("link_conflict", existing.to_string())
                .with_details(json!({ "external_ref": external_ref, "existing": existing }))
        }
        UnresolvedReason::BelowConfidence {
            strategy,
            candidate,
        } => AdminResult::failed(
            "below_confidence",
            format!(
                "candidate '{}' from {} is below the auto-link threshold",
                candidate, strategy
            ),
        )
        .with_details(json!({ "external_ref": external_ref, "candidate": candidate, "strategy": strategy })),
        UnresolvedReason::NoCandidate => AdminResult::failed(
            "no_candidate",
            format!("no local user matches '{}'", external_ref),
        ),
    }
}
