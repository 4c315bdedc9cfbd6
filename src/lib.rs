//! ledgerlink - billing event reconciliation for credit-based products
//!
//! ledgerlink connects a payment processor's view of a payer (an external
//! customer reference) with a local user account, and keeps a per-user credit
//! ledger in step with the processor's billing events.
//!
//! # Features
//!
//! - **Identity matching**: ordered strategies (direct link, processor metadata,
//!   email, fuzzy name) with a store-backed queue for references that cannot be
//!   matched automatically
//! - **Credit ledger**: atomic consume / bonus / recharge with an append-only
//!   transaction log and time-boxed subscription grants
//! - **Event reconciliation**: exactly-once application of processor events,
//!   parking events for unmatched customers until a match replays them
//! - **Admin commands**: structured results for manual matching and ledger fixes
//! - **Persistence**: in-memory store, or SeaORM with the `database` feature
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ledgerlink::identity::{IdentityMatcher, InMemoryCustomerDirectory};
//! use ledgerlink::ledger::CreditLedger;
//! use ledgerlink::reconciler::{EventApplier, EventReconciler, PlanCatalogue};
//! use ledgerlink::storage::InMemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> ledgerlink::Result<()> {
//!     ledgerlink::init_tracing();
//!     let config = ledgerlink::ConfigBuilder::new().from_env().build()?;
//!
//!     let store = Arc::new(InMemoryStore::new());
//!     let customers = Arc::new(InMemoryCustomerDirectory::new());
//!     let matcher = IdentityMatcher::new(store.clone(), store.clone(), customers)
//!         .with_retry_policy(config.retry.clone())
//!         .with_config(config.matching.clone());
//!     let applier = Arc::new(EventApplier::new(
//!         CreditLedger::new(store.clone()),
//!         store.clone(),
//!         store.clone(),
//!     ));
//!     let reconciler = EventReconciler::new(matcher, applier)
//!         .with_plans(PlanCatalogue::builder().plan("pro", "price_pro", 100).build());
//!
//!     let outcome = reconciler.handle_webhook(&verified_payload).await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod audit;
mod config;
mod error;
pub mod identity;
pub mod ledger;
pub mod locks;
pub mod reconciler;
pub mod retry;
pub mod storage;
pub mod testing;
mod utils;

pub use config::{Config, ConfigBuilder, LedgerConfig, LoggingConfig, MatchingConfig, SweeperConfig};
pub use error::{LedgerLinkError, LinkOwner, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "ledgerlink=debug")
/// - `LEDGERLINK_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("LEDGERLINK_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
