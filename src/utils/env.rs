/// Get environment variable with REBILL_ prefix, falling back to unprefixed version
///
/// This helper function checks for `REBILL_{key}` first, then falls back to `{key}`
/// for compatibility with standard environment variable naming.
///
/// # Examples
///
/// ```rust
/// use rebill::utils::get_env_with_prefix;
///
/// // Checks REBILL_RETRY_LIMIT first, then RETRY_LIMIT
/// let limit = get_env_with_prefix("RETRY_LIMIT");
///
/// // Checks REBILL_COOLING_OFF_DAYS first, then COOLING_OFF_DAYS
/// let window = get_env_with_prefix("COOLING_OFF_DAYS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("REBILL_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}
