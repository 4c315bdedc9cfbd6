//! Identity matching.
//!
//! Maps external customer references from the payment processor to local
//! users, keeps the one-to-one customer links, and queues references that
//! could not be matched for operators.

#[cfg(feature = "stripe")]
mod live_client;
mod matcher;
mod processor;
mod store;
mod strategies;

#[cfg(feature = "stripe")]
pub use live_client::{InvalidApiKeyError, LiveCustomerDirectory};
pub use matcher::{
    BatchItem, BatchItemOutcome, BatchReport, ContextHints, IdentityMatcher, MatchedUser,
    PendingReplay, ReplaySummary, Resolution, UnresolvedReason,
};
pub use processor::{
    CustomerDirectory, InMemoryCustomerDirectory, META_USER_ID_KEYS, ProcessorCustomer,
    local_user_id_from,
};
pub use store::{
    CustomerLink, IdentityStore, LinkStatus, LinkWrite, LocalUser, ParkedEvent, ParkedStatus,
    ReferenceContext, UnresolvedReference, UnresolvedStatus, UserDirectory,
};
pub use strategies::{
    Confidence, MatchEvidence, MatchStrategy, STRATEGIES, Strategy, StrategyResult,
    normalize_name, run_strategies,
};
