//! Live Stripe customer directory.
//!
//! Read-only: the matcher only ever retrieves customers. Retries happen in the
//! matcher through [`crate::retry::with_retry`], so this client only maps
//! Stripe errors onto the crate's error classes.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;

use super::processor::{CustomerDirectory, ProcessorCustomer};
use crate::error::{LedgerLinkError, Result};

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Accepts `sk_test_`, `sk_live_`, `rk_test_` and `rk_live_` keys.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_"
                .to_string(),
        });
    }
    Ok(())
}

/// Customer lookups against the Stripe API.
#[derive(Clone)]
pub struct LiveCustomerDirectory {
    client: stripe::Client,
    api_key: SecretString,
}

impl LiveCustomerDirectory {
    /// Create a directory from a secret or restricted key.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(api_key: impl Into<SecretString>) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "ledgerlink".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );
        Ok(Self { client, api_key })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }
}

impl std::fmt::Debug for LiveCustomerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCustomerDirectory")
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CustomerDirectory for LiveCustomerDirectory {
    async fn fetch_customer(&self, external_ref: &str) -> Result<Option<ProcessorCustomer>> {
        let Ok(customer_id) = external_ref.parse::<stripe::CustomerId>() else {
            // Not a Stripe customer id; nothing upstream can match it.
            return Ok(None);
        };

        let customer = match stripe::Customer::retrieve(&self.client, &customer_id, &[]).await {
            Ok(customer) => customer,
            Err(stripe::StripeError::Stripe(ref e)) if e.http_status == 404 => return Ok(None),
            Err(e) => return Err(map_stripe_error(e, "fetch_customer")),
        };

        if customer.deleted {
            return Ok(None);
        }

        let metadata: BTreeMap<String, String> =
            customer.metadata.into_iter().flatten().collect();

        Ok(Some(ProcessorCustomer {
            id: customer.id.to_string(),
            email: customer.email,
            name: customer.name,
            metadata,
            deleted: false,
        }))
    }
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> LedgerLinkError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .unwrap_or_else(|| "Unknown error".to_string());
            if status == 429 || (500..600).contains(&status) {
                LedgerLinkError::upstream(operation, format!("HTTP {}: {}", status, message))
            } else {
                LedgerLinkError::internal(format!(
                    "Stripe rejected {} (HTTP {}): {}",
                    operation, status, message
                ))
            }
        }
        stripe::StripeError::Timeout => LedgerLinkError::upstream(operation, "request timed out"),
        stripe::StripeError::ClientError(msg) => {
            LedgerLinkError::upstream(operation, format!("HTTP client error: {msg}"))
        }
        other => LedgerLinkError::internal(format!("Stripe {} failed: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk_test_0123456789abcdef").is_ok());
        assert!(validate_api_key("rk_live_0123456789abcdef").is_ok());
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        assert!(validate_api_key("pk_test_0123456789abcdef").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let directory = LiveCustomerDirectory::new("sk_test_0123456789abcdef").unwrap();
        let debug = format!("{:?}", directory);
        assert!(!debug.contains("0123456789abcdef"));
        assert!(directory.is_test_mode());
    }

    #[test]
    fn test_timeout_is_upstream() {
        let err = map_stripe_error(stripe::StripeError::Timeout, "fetch_customer");
        assert!(err.is_retryable());
    }
}
