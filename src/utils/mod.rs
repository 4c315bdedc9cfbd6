//! Environment helpers shared by configuration loading.

pub mod env;

pub use env::{get_env_with_prefix, parse_env_with_prefix};
