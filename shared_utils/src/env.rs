//! Environment lookups used for secrets and deployment overrides.

use thiserror::Error;

/// A required variable is unset.
#[derive(Debug, Error)]
#[error("{0} is not set")]
pub struct MissingEnvVarError(pub String);

/// Reads a required variable. Unset, empty and non-UTF-8 values are all missing.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    get_env_var_opt(name).ok_or_else(|| MissingEnvVarError(name.to_string()))
}

/// Reads an optional environment variable. Empty values count as unset.
pub fn get_env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
