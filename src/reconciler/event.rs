//! Typed billing events.
//!
//! Events reach the reconciler already verified. [`BillingEvent::from_webhook`]
//! turns a processor event envelope (`id`, `type`, `created`, `data.object`)
//! into one of the handled kinds.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::plans::PlanCatalogue;
use crate::error::{LedgerLinkError, Result};
use crate::identity::ContextHints;

/// Subscription statuses that end the subscription's entitlement.
const TERMINAL_STATUSES: &[&str] = &["canceled", "unpaid", "incomplete_expired"];

/// Subscription statuses that mean the subscription is paying for credits.
const LIVE_STATUSES: &[&str] = &["active", "trialing"];

/// Metadata key that overrides the catalogue's credit amount.
const META_CREDITS: &str = "credits";

/// A verified billing event from the payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Processor-assigned idempotency key.
    pub event_key: String,
    /// External customer reference the event belongs to.
    pub external_ref: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default)]
    pub hints: ContextHints,
}

/// The handled event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A subscription started paying. Opens the period's credit grant.
    SubscriptionActivated {
        subscription_ref: String,
        credits: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        #[serde(default)]
        price_ref: Option<String>,
    },
    /// A subscription changed status.
    SubscriptionUpdated {
        subscription_ref: String,
        status: String,
    },
    /// A renewal invoice was paid.
    InvoicePaid {
        invoice_ref: String,
        #[serde(default)]
        subscription_ref: Option<String>,
        credits: i64,
        #[serde(default)]
        period_start: Option<DateTime<Utc>>,
        #[serde(default)]
        period_end: Option<DateTime<Utc>>,
    },
    /// A subscription was canceled.
    SubscriptionCanceled { subscription_ref: String },
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionActivated { .. } => "subscription_activated",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
        }
    }

    #[must_use]
    pub fn subscription_ref(&self) -> Option<&str> {
        match self {
            Self::SubscriptionActivated {
                subscription_ref, ..
            }
            | Self::SubscriptionUpdated {
                subscription_ref, ..
            }
            | Self::SubscriptionCanceled { subscription_ref } => Some(subscription_ref),
            Self::InvoicePaid {
                subscription_ref, ..
            } => subscription_ref.as_deref(),
        }
    }

    /// Field checks that must hold before the event touches any store.
    fn validate(&self) -> Result<()> {
        match self {
            Self::SubscriptionActivated {
                subscription_ref,
                credits,
                period_start,
                period_end,
                ..
            } => {
                non_empty("subscription_ref", subscription_ref)?;
                positive_credits(*credits)?;
                ordered_period(*period_start, *period_end)
            }
            Self::SubscriptionUpdated {
                subscription_ref,
                status,
            } => {
                non_empty("subscription_ref", subscription_ref)?;
                non_empty("status", status)
            }
            Self::InvoicePaid {
                invoice_ref,
                subscription_ref,
                credits,
                period_start,
                period_end,
            } => {
                non_empty("invoice_ref", invoice_ref)?;
                if let Some(subscription_ref) = subscription_ref {
                    non_empty("subscription_ref", subscription_ref)?;
                }
                positive_credits(*credits)?;
                match (period_start, period_end) {
                    (Some(start), Some(end)) => ordered_period(*start, *end),
                    _ => Ok(()),
                }
            }
            Self::SubscriptionCanceled { subscription_ref } => {
                non_empty("subscription_ref", subscription_ref)
            }
        }
    }

    /// Whether a status update ends the subscription's grant.
    #[must_use]
    pub fn is_terminal_status(status: &str) -> bool {
        TERMINAL_STATUSES.contains(&status)
    }
}

impl BillingEvent {
    #[must_use]
    pub fn new(event_key: impl Into<String>, external_ref: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_key: event_key.into(),
            external_ref: external_ref.into(),
            occurred_at: Utc::now(),
            kind,
            hints: ContextHints::default(),
        }
    }

    #[must_use]
    pub fn with_hints(mut self, hints: ContextHints) -> Self {
        self.hints = hints;
        self
    }

    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Hints for the matcher, enriched with what the event itself says.
    #[must_use]
    pub fn match_hints(&self) -> ContextHints {
        let mut hints = self.hints.clone();
        if hints.subscription_ref.is_none() {
            hints.subscription_ref = self.kind.subscription_ref().map(String::from);
        }
        if hints.event_type.is_none() {
            hints.event_type = Some(self.event_type().to_string());
        }
        hints
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.event_key.trim().is_empty() {
            return Err(LedgerLinkError::validation("event_key", "must not be empty"));
        }
        if self.external_ref.trim().is_empty() {
            return Err(LedgerLinkError::validation(
                "external_ref",
                "must not be empty",
            ));
        }
        self.kind.validate()
    }

    /// Convert a verified processor event envelope.
    ///
    /// Returns `Ok(None)` for event types that carry no ledger effect.
    pub fn from_webhook(envelope: &Value, plans: &PlanCatalogue) -> Result<Option<Self>> {
        let event_key = str_field(envelope, "id")
            .ok_or_else(|| invalid("missing event id"))?
            .to_string();
        let event_type = str_field(envelope, "type").ok_or_else(|| invalid("missing event type"))?;
        let object = envelope
            .get("data")
            .and_then(|d| d.get("object"))
            .filter(|o| o.is_object())
            .ok_or_else(|| invalid("missing data.object"))?;
        let occurred_at = envelope
            .get("created")
            .and_then(Value::as_i64)
            .and_then(timestamp)
            .unwrap_or_else(Utc::now);

        let kind = match event_type {
            "customer.subscription.created" | "customer.subscription.updated" => {
                subscription_kind(object, plans)?
            }
            "customer.subscription.deleted" => Some(EventKind::SubscriptionCanceled {
                subscription_ref: required_str(object, "id")?,
            }),
            "invoice.paid" => invoice_kind(object, plans)?,
            other => {
                tracing::debug!(
                    target: "ledgerlink::reconciler",
                    event_key = %event_key,
                    event_type = other,
                    "Ignoring event type"
                );
                None
            }
        };
        let Some(kind) = kind else {
            return Ok(None);
        };

        let external_ref = customer_ref(object).ok_or_else(|| invalid("missing customer"))?;
        let hints = ContextHints {
            email: str_field(object, "customer_email").map(String::from),
            name: str_field(object, "customer_name").map(String::from),
            subscription_ref: kind.subscription_ref().map(String::from),
            event_type: Some(event_type.to_string()),
            metadata: string_map(object.get("metadata")),
        };

        Ok(Some(Self {
            event_key,
            external_ref,
            occurred_at,
            kind,
            hints,
        }))
    }
}

fn subscription_kind(object: &Value, plans: &PlanCatalogue) -> Result<Option<EventKind>> {
    let subscription_ref = required_str(object, "id")?;
    let status = str_field(object, "status").unwrap_or("active");

    if !LIVE_STATUSES.contains(&status) {
        return Ok(Some(EventKind::SubscriptionUpdated {
            subscription_ref,
            status: status.to_string(),
        }));
    }

    let first_item = object
        .get("items")
        .and_then(|i| i.get("data"))
        .and_then(|d| d.get(0));
    let price_ref = first_item
        .and_then(|item| item.get("price"))
        .and_then(|p| str_field(p, "id"))
        .map(String::from);

    let credits = credits_from(object, price_ref.as_deref(), plans).ok_or_else(|| {
        invalid(format!(
            "no credit plan for subscription {} (price {:?})",
            subscription_ref, price_ref
        ))
    })?;

    // Period bounds moved from the subscription onto its items in newer API versions.
    let period = |key: &str| {
        object
            .get(key)
            .or_else(|| first_item.and_then(|item| item.get(key)))
            .and_then(Value::as_i64)
            .and_then(timestamp)
    };
    let period_start = period("current_period_start").ok_or_else(|| invalid("missing period start"))?;
    let period_end = period("current_period_end").ok_or_else(|| invalid("missing period end"))?;

    Ok(Some(EventKind::SubscriptionActivated {
        subscription_ref,
        credits,
        period_start,
        period_end,
        price_ref,
    }))
}

fn invoice_kind(object: &Value, plans: &PlanCatalogue) -> Result<Option<EventKind>> {
    // The first invoice pays for the period the activation already granted.
    if str_field(object, "billing_reason") == Some("subscription_create") {
        return Ok(None);
    }

    let invoice_ref = required_str(object, "id")?;
    let line = object
        .get("lines")
        .and_then(|l| l.get("data"))
        .and_then(|d| d.get(0));
    let price_ref = line
        .and_then(|l| l.get("price"))
        .and_then(|p| str_field(p, "id"));

    let Some(credits) = credits_from(object, price_ref, plans) else {
        tracing::debug!(
            target: "ledgerlink::reconciler",
            invoice_ref = %invoice_ref,
            "Invoice carries no credits"
        );
        return Ok(None);
    };

    let period = |key: &str| {
        line.and_then(|l| l.get("period"))
            .and_then(|p| p.get(key))
            .and_then(Value::as_i64)
            .and_then(timestamp)
    };

    Ok(Some(EventKind::InvoicePaid {
        invoice_ref,
        subscription_ref: str_field(object, "subscription").map(String::from),
        credits,
        period_start: period("start"),
        period_end: period("end"),
    }))
}

/// Credits from a `credits` metadata override, then from the catalogue.
fn credits_from(object: &Value, price_ref: Option<&str>, plans: &PlanCatalogue) -> Option<i64> {
    let from_metadata = object
        .get("metadata")
        .and_then(|m| m.get(META_CREDITS))
        .and_then(|v| match v {
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        });

    from_metadata
        .or_else(|| price_ref.and_then(|p| plans.credits_for_price(p)))
        .filter(|credits| *credits > 0)
}

/// The customer field is either an id or an expanded object.
fn customer_ref(object: &Value) -> Option<String> {
    let id = match object.get("customer")? {
        Value::String(id) => Some(id.clone()),
        expanded => str_field(expanded, "id").map(String::from),
    };
    id.filter(|id| !id.is_empty())
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn required_str(value: &Value, key: &str) -> Result<String> {
    str_field(value, key)
        .map(String::from)
        .ok_or_else(|| invalid(format!("missing {}", key)))
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn non_empty(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LedgerLinkError::validation(field, "must not be empty"));
    }
    Ok(())
}

fn positive_credits(credits: i64) -> Result<()> {
    if credits <= 0 {
        return Err(LedgerLinkError::validation("credits", "must be positive"));
    }
    Ok(())
}

fn ordered_period(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(LedgerLinkError::validation(
            "period_end",
            "period must end after it starts",
        ));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> LedgerLinkError {
    LedgerLinkError::InvalidEvent(message.into())
}
