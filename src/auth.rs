//! Bearer token authentication against the users listed in config.yaml.

use crate::config::{Config, UserConfig};

const BEARER: &str = "bearer ";

/// Compares two tokens without short-circuiting on the first differing byte.
/// Empty tokens never match.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }

    let diff = provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));

    diff == 0 && provided.len() == expected.len()
}

/// Returns the token of a `Bearer <token>` header. The scheme is case-insensitive.
pub fn bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let scheme = header.get(..BEARER.len())?;
    if !scheme.eq_ignore_ascii_case(BEARER) {
        return None;
    }

    Some(header[BEARER.len()..].trim()).filter(|token| !token.is_empty())
}

/// The configured user owning the token in an `Authorization` header value.
pub fn resolve_user(config: &Config, header: Option<&str>) -> Option<UserConfig> {
    let token = bearer_token(header?)?;
    config.user_by_token(token).cloned()
}
