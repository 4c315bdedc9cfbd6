//! Admin result and view types.
//!
//! These types are serialized as admin API responses.

use serde::Serialize;

use crate::error::LedgerLinkError;
use crate::identity::{CustomerLink, LocalUser, ParkedEvent, ProcessorCustomer, UnresolvedReference};
use crate::ledger::{
    CreditBalance, CreditGrant, CreditTransaction, LedgerVerification, ReconciliationWarning,
};

/// Structured result of an admin command.
///
/// On success the payload fields sit next to `success`; on failure `code` and
/// `reason` say what went wrong and `details` carries what an operator needs to
/// act on it (current link owner, candidate list, balance).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> AdminResult<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            code: None,
            reason: None,
            data: Some(data),
            details: None,
        }
    }

    #[must_use]
    pub fn failed(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code.into()),
            reason: Some(reason.into()),
            data: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Failure result for an error, keeping its actionable context.
    #[must_use]
    pub fn from_error(err: &LedgerLinkError) -> Self {
        let result = Self::failed(err.code(), err.to_string());
        match err {
            LedgerLinkError::Conflict {
                external_ref,
                user_id,
                existing,
            } => result.with_details(serde_json::json!({
                "external_ref": external_ref,
                "user_id": user_id,
                "existing": existing,
            })),
            LedgerLinkError::AmbiguousMatch {
                external_ref,
                candidates,
            } => result.with_details(serde_json::json!({
                "external_ref": external_ref,
                "candidates": candidates,
            })),
            LedgerLinkError::NotFound { entity, id } => result.with_details(serde_json::json!({
                "entity": entity,
                "id": id,
            })),
            LedgerLinkError::Validation { field, .. } => {
                result.with_details(serde_json::json!({ "field": field }))
            }
            _ => result,
        }
    }

    /// Payload of a successful result.
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// A pending reference with the number of events waiting on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingReference {
    #[serde(flatten)]
    pub reference: UnresolvedReference,
    pub parked_events: usize,
}

/// Response for `pending-unresolved`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingUnresolved {
    pub references: Vec<PendingReference>,
}

/// Everything known about one external reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerInfo {
    pub external_ref: String,
    /// The active link, if any.
    pub link: Option<CustomerLink>,
    /// Every link ever made for the reference, oldest first.
    pub link_history: Vec<CustomerLink>,
    pub unresolved: Option<UnresolvedReference>,
    pub parked_events: Vec<ParkedEvent>,
    /// Processor-side record. `None` if the processor does not know it or
    /// could not be reached.
    pub processor: Option<ProcessorCustomer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_error: Option<String>,
}

/// Response for `search-users`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSearch {
    pub query: String,
    pub users: Vec<LocalUser>,
}

/// Response for `consume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Consumed {
    pub balance: i64,
    pub consumed: i64,
    pub transaction_id: String,
}

/// Response for `abandon-reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Abandoned {
    pub external_ref: String,
    /// Events that stay stored for the reference.
    pub parked_events: usize,
}

/// Response for `balance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    #[serde(flatten)]
    pub balance: CreditBalance,
    pub grants: Vec<CreditGrant>,
    pub verification: LedgerVerification,
}

/// Response for `reconciliation-warnings`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarningList {
    pub warnings: Vec<ReconciliationWarning>,
}

/// Response for `transactions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionList {
    pub user_id: String,
    pub transactions: Vec<CreditTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkOwner;

    #[test]
    fn test_success_flattens_payload() {
        let result = AdminResult::ok(Consumed {
            balance: 5,
            consumed: 5,
            transaction_id: "tx_1".to_string(),
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["balance"], 5);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_conflict_carries_owner() {
        let err = LedgerLinkError::Conflict {
            external_ref: "cus_abc".to_string(),
            user_id: "user_2".to_string(),
            existing: LinkOwner::ReferenceClaimedBy {
                user_id: "user_1".to_string(),
            },
        };
        let result: AdminResult<Consumed> = AdminResult::from_error(&err);
        assert!(!result.success);
        assert_eq!(result.code(), Some("conflict"));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["details"]["existing"]["user_id"], "user_1");
    }

    #[test]
    fn test_ambiguous_carries_candidates() {
        let err = LedgerLinkError::AmbiguousMatch {
            external_ref: "cus_abc".to_string(),
            candidates: vec!["user_1".to_string(), "user_2".to_string()],
        };
        let result: AdminResult<Consumed> = AdminResult::from_error(&err);
        let details = result.details.unwrap();
        assert_eq!(details["candidates"].as_array().unwrap().len(), 2);
    }
}
