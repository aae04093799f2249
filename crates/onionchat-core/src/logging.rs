//! Log-field helpers that keep identities and key material out of logs.
//!
//! Public keys already print abbreviated through their `Debug` impl, so
//! log them as `peer = ?key`. Onion addresses and raw control-port lines go
//! through the helpers here:
//!
//! ```ignore
//! info!(onion = %RedactedOnion(address.as_str()), "Hidden service published");
//! ```

use std::fmt;

/// Shows the first 4 characters and the `.onion` tail of an onion address.
pub struct RedactedOnion<'a>(pub &'a str);

impl fmt::Display for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 && s.is_char_boundary(4) && s.is_char_boundary(s.len() - 10) {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 10..])
        } else {
            write!(f, "[REDACTED ONION]")
        }
    }
}

impl fmt::Debug for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "secret",
    "private",
    "key",
    "token",
    "auth",
    "cookie",
];

/// Check if a string appears to contain sensitive data.
pub fn appears_sensitive(s: &str) -> bool {
    let lower = s.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitize a string for logging, redacting it if it looks sensitive.
pub fn sanitize_for_log(s: &str) -> String {
    if appears_sensitive(s) {
        "[REDACTED]".to_string()
    } else {
        s.to_string()
    }
}
