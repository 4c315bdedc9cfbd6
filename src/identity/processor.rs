//! Processor-side customer lookups.
//!
//! The matcher only reads customers; it never creates or updates them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{LedgerLinkError, Result};

/// Metadata keys that may carry the local user id, checked in order.
pub const META_USER_ID_KEYS: &[&str] = &["user_id", "billable_id"];

/// A payer as the payment processor knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub deleted: bool,
}

impl ProcessorCustomer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

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

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Local user id embedded in metadata, if any.
    #[must_use]
    pub fn local_user_id(&self) -> Option<&str> {
        local_user_id_from(&self.metadata)
    }
}

/// Find the local user id in a metadata map.
#[must_use]
pub fn local_user_id_from(metadata: &BTreeMap<String, String>) -> Option<&str> {
    META_USER_ID_KEYS
        .iter()
        .filter_map(|k| metadata.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Trait for fetching customers from the payment processor.
///
/// Transient failures must be reported as [`LedgerLinkError::UpstreamUnavailable`]
/// so callers can retry them.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    /// Fetch a customer. Deleted or unknown customers are `Ok(None)`.
    async fn fetch_customer(&self, external_ref: &str) -> Result<Option<ProcessorCustomer>>;
}

/// In-memory customer directory for development and tests.
///
/// Can be told to fail the next N lookups to exercise retry and parking.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCustomerDirectory {
    inner: Arc<InMemoryCustomerDirectoryInner>,
}

#[derive(Debug, Default)]
struct InMemoryCustomerDirectoryInner {
    customers: RwLock<HashMap<String, ProcessorCustomer>>,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl InMemoryCustomerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer: ProcessorCustomer) {
        if let Ok(mut customers) = self.inner.customers.write() {
            customers.insert(customer.id.clone(), customer);
        }
    }

    /// Fail the next `count` lookups with `UpstreamUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of lookups made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomerDirectory {
    async fn fetch_customer(&self, external_ref: &str) -> Result<Option<ProcessorCustomer>> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LedgerLinkError::upstream(
                "fetch_customer",
                "simulated processor outage",
            ));
        }

        let customers = self
            .inner
            .customers
            .read()
            .map_err(|_| LedgerLinkError::internal("customer directory lock poisoned"))?;
        Ok(customers
            .get(external_ref)
            .filter(|c| !c.deleted)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_user_id_key_order() {
        let customer = ProcessorCustomer::new("cus_1")
            .with_metadata("billable_id", "user_b")
            .with_metadata("user_id", "user_a");
        assert_eq!(customer.local_user_id(), Some("user_a"));

        let customer = ProcessorCustomer::new("cus_2")
            .with_metadata("user_id", "  ")
            .with_metadata("billable_id", "user_b");
        assert_eq!(customer.local_user_id(), Some("user_b"));

        assert_eq!(ProcessorCustomer::new("cus_3").local_user_id(), None);
    }

    #[tokio::test]
    async fn test_in_memory_directory() {
        let directory = InMemoryCustomerDirectory::new();
        directory.insert(ProcessorCustomer::new("cus_1").with_email("a@b.com"));

        let found = directory.fetch_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(found.email.as_deref(), Some("a@b.com"));
        assert!(directory.fetch_customer("cus_missing").await.unwrap().is_none());
        assert_eq!(directory.calls(), 2);
    }

    #[tokio::test]
    async fn test_deleted_customer_is_none() {
        let directory = InMemoryCustomerDirectory::new();
        let mut customer = ProcessorCustomer::new("cus_1");
        customer.deleted = true;
        directory.insert(customer);
        assert!(directory.fetch_customer("cus_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let directory = InMemoryCustomerDirectory::new();
        directory.insert(ProcessorCustomer::new("cus_1"));
        directory.fail_next(2);

        assert!(directory.fetch_customer("cus_1").await.unwrap_err().is_retryable());
        assert!(directory.fetch_customer("cus_1").await.is_err());
        assert!(directory.fetch_customer("cus_1").await.unwrap().is_some());
    }
}
