//! Per-user credit ledger.
//!
//! - [`LedgerStore`]: persistence for balances, transactions, grants and warnings
//! - [`CreditLedger`]: consumption, bonus, recharge and grant expiry
//! - [`ExpirySweeper`]: periodic expiry in the background

mod engine;
mod store;
mod sweeper;

pub use engine::{
    BonusRequest, ConsumeOutcome, CreditLedger, ExpirySummary, GrantOutcome, GrantWindow,
    LedgerVerification, RechargeRequest, SubscriptionGrantRequest, subscription_grant_key,
};
pub use store::{
    ApplyOutcome, CreditBalance, CreditGrant, CreditTransaction, GrantDraw, GrantEffect,
    GrantStatus, LedgerMutation, LedgerStore, ReconciliationWarning, TransactionKind,
};
pub use sweeper::{ExpirySweeper, SweeperHandle};
