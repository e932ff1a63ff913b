//! Bearer token gate

use crate::error::ProxyError;
use hyper::header::{HeaderMap, AUTHORIZATION};

/// Checks `Authorization: Bearer <secret>` against the configured secret
#[derive(Clone)]
pub struct AuthGate {
    expected: Vec<u8>,
}

impl AuthGate {
    pub fn new(api_key: &str) -> Self {
        Self {
            expected: format!("Bearer {}", api_key).into_bytes(),
        }
    }

    /// Exact, case-sensitive match of the whole header value
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ProxyError> {
        match headers.get(AUTHORIZATION) {
            Some(value) if constant_time_eq(value.as_bytes(), &self.expected) => Ok(()),
            _ => Err(ProxyError::Unauthorized),
        }
    }
}

// Keep the secret out of Debug output
impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

/// Compare without short-circuiting on the first differing byte.
/// Only the length of `expected` is observable through timing.
fn constant_time_eq(presented: &[u8], expected: &[u8]) -> bool {
    let mut diff = presented.len() ^ expected.len();
    for (i, &byte) in expected.iter().enumerate() {
        let other = presented.get(i).copied().unwrap_or(!byte);
        diff |= usize::from(other ^ byte);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers_with(value: &'static [u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_bytes(value).unwrap());
        headers
    }

    #[test]
    fn test_exact_match_passes() {
        let gate = AuthGate::new("s3cret");
        assert!(gate.check(&headers_with(b"Bearer s3cret")).is_ok());
    }

    #[test]
    fn test_missing_header_rejected() {
        let gate = AuthGate::new("s3cret");
        assert!(matches!(
            gate.check(&HeaderMap::new()),
            Err(ProxyError::Unauthorized)
        ));
    }

    #[test]
    fn test_near_misses_rejected() {
        let gate = AuthGate::new("s3cret");
        let values: [&'static [u8]; 9] = [
            b"bearer s3cret",
            b"Bearer S3cret",
            b"Bearer s3cre",
            b"Bearer s3cret2",
            b"Bearer  s3cret",
            b"Basic s3cret",
            b"s3cret",
            b"Bearer s3cret\xff",
            b"",
        ];
        for value in values {
            assert!(gate.check(&headers_with(value)).is_err(), "{:?}", value);
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"abd", b"abc"));
        assert!(!constant_time_eq(b"ab", b"abc"));
        assert!(!constant_time_eq(b"abcd", b"abc"));
        assert!(!constant_time_eq(b"", b"abc"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let gate = AuthGate::new("s3cret");
        assert!(!format!("{:?}", gate).contains("s3cret"));
    }
}
