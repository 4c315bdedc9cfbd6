//! A fully wired reconciler over in-memory stores.

use std::sync::Arc;

use crate::admin::ReconciliationAdmin;
use crate::audit::RecordingAuditLogger;
use crate::config::MatchingConfig;
use crate::identity::{IdentityMatcher, InMemoryCustomerDirectory};
use crate::ledger::CreditLedger;
use crate::reconciler::{EventApplier, EventReconciler, PlanCatalogue};
use crate::retry::RetryPolicy;
use crate::storage::InMemoryStore;

type MemoryReconciler = EventReconciler<InMemoryStore, InMemoryStore>;

/// Every component wired the way an application would, with audit events
/// recorded and retries disabled.
///
/// ```rust,ignore
/// let h = TestHarness::new();
/// let user = UserFixture::new().insert(&h.store);
/// h.customers.insert(user.customer("cus_abc"));
/// h.reconciler.handle(event).await?;
/// ```
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub customers: InMemoryCustomerDirectory,
    pub audit: RecordingAuditLogger,
    pub reconciler: Arc<MemoryReconciler>,
    pub admin: ReconciliationAdmin<InMemoryStore, InMemoryStore>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// The ledger shared by the reconciler and the admin commands.
    pub fn ledger(&self) -> &CreditLedger<InMemoryStore> {
        self.reconciler.applier().ledger()
    }

    pub fn matcher(&self) -> &IdentityMatcher<InMemoryStore> {
        self.reconciler.matcher()
    }
}

/// Builder for [`TestHarness`].
#[derive(Default)]
pub struct TestHarnessBuilder {
    retry: Option<RetryPolicy>,
    matching: Option<MatchingConfig>,
    plans: Option<PlanCatalogue>,
}

impl TestHarnessBuilder {
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = Some(matching);
        self
    }

    pub fn with_plans(mut self, plans: PlanCatalogue) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn build(self) -> TestHarness {
        let store = Arc::new(InMemoryStore::new());
        let customers = InMemoryCustomerDirectory::new();
        let audit = RecordingAuditLogger::new();
        let audit_logger = Arc::new(audit.clone());

        let matcher = IdentityMatcher::new(store.clone(), store.clone(), Arc::new(customers.clone()))
            .with_retry_policy(self.retry.unwrap_or_else(RetryPolicy::none))
            .with_config(self.matching.unwrap_or_default())
            .with_audit_logger(audit_logger.clone());
        let ledger = CreditLedger::new(store.clone()).with_audit_logger(audit_logger.clone());
        let applier = Arc::new(
            EventApplier::new(ledger, store.clone(), store.clone())
                .with_audit_logger(audit_logger.clone()),
        );
        let reconciler = Arc::new(
            EventReconciler::new(matcher, applier)
                .with_plans(self.plans.unwrap_or_default())
                .with_audit_logger(audit_logger),
        );
        let admin = ReconciliationAdmin::new(reconciler.clone());

        TestHarness {
            store,
            customers,
            audit,
            reconciler,
            admin,
        }
    }
}
