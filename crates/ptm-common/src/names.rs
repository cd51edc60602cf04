//! Validation of host and device names.

use crate::error::{PtmError, PtmResult};

/// Maximum length of a Linux network device name (IFNAMSIZ - 1).
pub const MAX_IFNAME_LENGTH: usize = 15;

/// Maximum length of a host name. Host names double as namespace names.
pub const MAX_HOST_NAME_LENGTH: usize = 64;

/// Validate a network device name.
///
/// Device names must:
/// - Be 1-15 characters long
/// - Not contain `/`, `:` or whitespace
///
/// # Errors
///
/// Returns a [`PtmError::Config`] keyed by `key` if the name is invalid.
pub fn validate_ifname(key: &str, name: &str) -> PtmResult<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LENGTH {
        return Err(PtmError::config(
            key,
            format!(
                "interface name '{name}' must be 1-{MAX_IFNAME_LENGTH} characters"
            ),
        ));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(PtmError::config(
            key,
            format!("interface name '{name}' contains an invalid character"),
        ));
    }
    Ok(())
}

/// Validate a host name.
///
/// Host names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, dots, hyphens, and underscores
/// - Start with an alphanumeric character
///
/// # Errors
///
/// Returns a [`PtmError::Config`] keyed by `key` if the name is invalid.
pub fn validate_host_name(key: &str, name: &str) -> PtmResult<()> {
    let invalid = || PtmError::config(key, format!("invalid host name '{name}'"));

    if name.is_empty() || name.len() > MAX_HOST_NAME_LENGTH {
        return Err(invalid());
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ifnames() {
        assert!(validate_ifname("k", "eth0").is_ok());
        assert!(validate_ifname("k", "vzoo1eth0").is_ok());
        assert!(validate_ifname("k", "eth0.100").is_ok());
        assert!(validate_ifname("k", &"a".repeat(15)).is_ok());
    }

    #[test]
    fn invalid_ifnames() {
        assert!(validate_ifname("k", "").is_err());
        assert!(validate_ifname("k", &"a".repeat(16)).is_err());
        assert!(validate_ifname("k", "eth 0").is_err());
        assert!(validate_ifname("k", "a/b").is_err());
    }

    #[test]
    fn host_names() {
        assert!(validate_host_name("k", "zoo1").is_ok());
        assert!(validate_host_name("k", "v1.1").is_ok());
        assert!(validate_host_name("k", "-zoo").is_err());
        assert!(validate_host_name("k", "zoo!").is_err());
        assert!(validate_host_name("k", "").is_err());
    }
}
