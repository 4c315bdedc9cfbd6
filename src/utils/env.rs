/// Read an environment variable with the `LEDGERLINK_` prefix, falling back to the bare key.
///
/// `get_env_with_prefix("RETRY_MAX_RETRIES")` checks `LEDGERLINK_RETRY_MAX_RETRIES`
/// first, then `RETRY_MAX_RETRIES`.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("LEDGERLINK_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read and parse a prefixed environment variable, ignoring values that fail to parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("LEDGERLINK_ENV_TEST_PREFIXED", "prefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_TEST_PREFIXED"),
            Some("prefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("LEDGERLINK_ENV_TEST_PREFIXED");
        }

        unsafe {
            std::env::set_var("ENV_TEST_BARE", "bare_value");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_BARE"), Some("bare_value".to_string()));
        unsafe {
            std::env::remove_var("ENV_TEST_BARE");
        }

        assert_eq!(get_env_with_prefix("ENV_TEST_MISSING"), None);
    }

    #[test]
    fn test_parse_env_with_prefix() {
        unsafe {
            std::env::set_var("LEDGERLINK_ENV_TEST_NUMBER", " 42 ");
            std::env::set_var("LEDGERLINK_ENV_TEST_GARBAGE", "forty-two");
        }
        assert_eq!(parse_env_with_prefix::<u32>("ENV_TEST_NUMBER"), Some(42));
        assert_eq!(parse_env_with_prefix::<u32>("ENV_TEST_GARBAGE"), None);
        unsafe {
            std::env::remove_var("LEDGERLINK_ENV_TEST_NUMBER");
            std::env::remove_var("LEDGERLINK_ENV_TEST_GARBAGE");
        }
    }
}
