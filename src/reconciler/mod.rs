//! Event reconciliation.
//!
//! Billing events from the payment processor are matched to a local user and
//! applied to the credit ledger exactly once. Events for unmatched customers
//! are parked until a match replays them.

mod applier;
mod event;
mod idempotency;
mod plans;
mod service;

pub use applier::{EventApplier, invoice_dedupe_key};
pub use event::{BillingEvent, EventKind};
pub use idempotency::{AppliedEvent, AppliedEventStore, AppliedResult};
pub use plans::{CreditPlan, PlanCatalogue, PlanCatalogueBuilder};
pub use service::{EventReconciler, ReconcileOutcome};
