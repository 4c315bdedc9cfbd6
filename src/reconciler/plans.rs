//! Credit plan catalogue.
//!
//! Maps a processor price to the number of credits one billing period is worth.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A collection of credit plans keyed by plan id.
#[derive(Clone, Debug, Default)]
pub struct PlanCatalogue {
    plans: HashMap<String, CreditPlan>,
}

impl PlanCatalogue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> PlanCatalogueBuilder {
        PlanCatalogueBuilder::default()
    }

    /// Add or replace a plan.
    pub fn add(&mut self, plan: CreditPlan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    #[must_use]
    pub fn get(&self, plan_id: &str) -> Option<&CreditPlan> {
        self.plans.get(plan_id)
    }

    /// Find the plan billed under a processor price id.
    #[must_use]
    pub fn find_by_price(&self, price_ref: &str) -> Option<&CreditPlan> {
        self.plans.values().find(|p| p.price_ref == price_ref)
    }

    /// Credits per period for a price, if the price belongs to a plan.
    #[must_use]
    pub fn credits_for_price(&self, price_ref: &str) -> Option<i64> {
        self.find_by_price(price_ref).map(|p| p.credits_per_period)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// One subscription plan and what it grants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPlan {
    pub id: String,
    /// Processor price id the plan is billed under.
    pub price_ref: String,
    pub credits_per_period: i64,
}

/// Builder for a [`PlanCatalogue`].
#[derive(Debug, Default)]
pub struct PlanCatalogueBuilder {
    plans: HashMap<String, CreditPlan>,
}

impl PlanCatalogueBuilder {
    /// Add a plan billed under `price_ref` worth `credits_per_period`.
    #[must_use]
    pub fn plan(mut self, id: &str, price_ref: &str, credits_per_period: i64) -> Self {
        self.plans.insert(
            id.to_string(),
            CreditPlan {
                id: id.to_string(),
                price_ref: price_ref.to_string(),
                credits_per_period,
            },
        );
        self
    }

    #[must_use]
    pub fn build(self) -> PlanCatalogue {
        PlanCatalogue { plans: self.plans }
    }
}
