//! Admin reconciliation surface.
//!
//! The crate provides the commands; applications expose them over whatever
//! transport they already run (HTTP routes, a CLI, a back-office job).
//!
//! # Example
//!
//! ```rust,ignore
//! use ledgerlink::admin::ReconciliationAdmin;
//!
//! let admin = ReconciliationAdmin::new(reconciler.clone());
//!
//! let pending = admin.pending_unresolved().await;
//! let result = admin.manual_match("cus_abc", "user_42", Some("ticket 1234")).await;
//! if !result.success {
//!     eprintln!("{}: {}", result.code.unwrap_or_default(), result.reason.unwrap_or_default());
//! }
//! ```

mod commands;
mod types;

pub use commands::ReconciliationAdmin;
pub use types::{
    Abandoned, AdminResult, BalanceReport, Consumed, CustomerInfo, PendingReference,
    PendingUnresolved, TransactionList, UserSearch, WarningList,
};
