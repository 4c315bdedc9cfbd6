//! Testing utilities for ledgerlink applications
//!
//! - [`fake`]: generated emails, names and processor references
//! - [`UserFixture`]: local users and their matching processor customers
//! - [`TestHarness`]: matcher, ledger, reconciler and admin over one [`InMemoryStore`](crate::storage::InMemoryStore)
//!
//! # Example
//!
//! ```rust,ignore
//! use ledgerlink::testing::{TestHarness, UserFixture};
//!
//! #[tokio::test]
//! async fn test_consume() {
//!     let h = TestHarness::new();
//!     let user = UserFixture::new().insert(&h.store);
//!
//!     h.admin.grant_bonus(&user.id, 10, "seed", None).await;
//!     let result = h.admin.consume(&user.id, 5, "x").await;
//!     assert_eq!(result.data().unwrap().balance, 5);
//! }
//! ```

mod fixtures;
mod harness;

pub use fixtures::{UserFixture, fake};
pub use harness::{TestHarness, TestHarnessBuilder};
