use std::str::FromStr;

/// Get environment variable with TIDEWAY_ prefix, falling back to unprefixed version
///
/// `get_env_with_prefix("QUEUE_DEFAULT")` checks `TIDEWAY_QUEUE_DEFAULT` first,
/// then `QUEUE_DEFAULT`.
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TIDEWAY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse a prefixed environment variable, ignoring values that fail to parse
pub fn parse_env_with_prefix<T: FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}
