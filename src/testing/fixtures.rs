//! Test fixtures for generating users and processor customers.

use uuid::Uuid;

use crate::identity::{LocalUser, ProcessorCustomer};
use crate::storage::InMemoryStore;

/// Helper functions for generating fake test data
pub mod fake {
    use super::*;

    fn short_id() -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    /// Generate a fake email address
    pub fn email() -> String {
        format!("test-{}@example.com", Uuid::new_v4().simple())
    }

    /// Generate a fake display name
    pub fn name() -> String {
        format!("Test User {}", short_id())
    }

    /// Generate a fake local user id
    pub fn user_id() -> String {
        format!("user_{}", short_id())
    }

    /// Generate a fake processor customer reference
    pub fn external_ref() -> String {
        format!("cus_{}", short_id())
    }

    /// Generate a fake processor subscription reference
    pub fn subscription_ref() -> String {
        format!("sub_{}", short_id())
    }

    /// Generate a fake processor event id
    pub fn event_key() -> String {
        format!("evt_{}", short_id())
    }

    /// Generate a random credit amount between min and max
    pub fn credits(min: i64, max: i64) -> i64 {
        fastrand::i64(min..=max)
    }
}

/// Builder for a local user, optionally paired with its processor customer.
///
/// ```rust,ignore
/// let user = UserFixture::new().with_email("a@b.com").insert(&store);
/// customers.insert(user.customer("cus_abc"));
/// ```
#[derive(Debug, Clone)]
pub struct UserFixture {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl Default for UserFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl UserFixture {
    /// A user with generated id, email and name.
    pub fn new() -> Self {
        Self {
            id: fake::user_id(),
            email: Some(fake::email()),
            name: Some(fake::name()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn without_email(mut self) -> Self {
        self.email = None;
        self
    }

    pub fn without_name(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn build(&self) -> LocalUser {
        LocalUser {
            id: self.id.clone(),
            email: self.email.clone(),
            display_name: self.name.clone(),
        }
    }

    /// Add the user to a store's directory and return the fixture.
    pub fn insert(self, store: &InMemoryStore) -> Self {
        store.add_local_user(self.build());
        self
    }

    /// A processor customer carrying this user's email and name.
    pub fn customer(&self, external_ref: impl Into<String>) -> ProcessorCustomer {
        let mut customer = ProcessorCustomer::new(external_ref);
        if let Some(email) = &self.email {
            customer = customer.with_email(email);
        }
        if let Some(name) = &self.name {
            customer = customer.with_name(name);
        }
        customer
    }
}
