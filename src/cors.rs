//! Cross-origin headers and preflight handling

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
};

/// CORS keys owned by the proxy; upstream copies of these are dropped
pub const UPSTREAM_SKIPPED: [HeaderName; 4] = [
    ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_EXPOSE_HEADERS,
];

const ALLOW_HEADERS: &str = "Authorization, Content-Type";
const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
/// 20 days
const MAX_AGE: &str = "1728000";

/// Which `Origin` values get echoed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Echo any origin verbatim
    Reflect,
    /// Echo only these origins (exact match)
    AllowList(Vec<String>),
}

impl OriginPolicy {
    /// Parse `ALLOWED_ORIGINS`: unset, empty or `*` reflects everything,
    /// otherwise a comma separated allow-list.
    pub fn parse(value: Option<&str>) -> Self {
        let value = match value.map(str::trim) {
            None | Some("") | Some("*") => return OriginPolicy::Reflect,
            Some(v) => v,
        };

        let origins: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();

        if origins.is_empty() {
            OriginPolicy::Reflect
        } else {
            OriginPolicy::AllowList(origins)
        }
    }

    pub fn admits(&self, origin: &HeaderValue) -> bool {
        match self {
            OriginPolicy::Reflect => true,
            OriginPolicy::AllowList(list) => list.iter().any(|o| o.as_bytes() == origin.as_bytes()),
        }
    }
}

/// Injects CORS headers into every response
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origins: OriginPolicy,
}

impl CorsPolicy {
    pub fn new(origins: OriginPolicy) -> Self {
        Self { origins }
    }

    /// Headers set on every response
    pub fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        if let Some(origin) = origin.filter(|o| self.origins.admits(o)) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
    }

    /// Extra headers for the 204 preflight answer
    pub fn apply_preflight(headers: &mut HeaderMap) {
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflects_any_origin() {
        let cors = CorsPolicy::new(OriginPolicy::Reflect);
        let origin = HeaderValue::from_static("https://example.com");
        let mut headers = HeaderMap::new();

        cors.apply(Some(&origin), &mut headers);

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://example.com");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Authorization, Content-Type");
        assert!(headers.get(ACCESS_CONTROL_ALLOW_METHODS).is_none());
    }

    #[test]
    fn test_no_origin_no_allow_origin() {
        let cors = CorsPolicy::new(OriginPolicy::Reflect);
        let mut headers = HeaderMap::new();

        cors.apply(None, &mut headers);

        assert!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn test_allow_list() {
        let cors = CorsPolicy::new(OriginPolicy::parse(Some(
            "https://app.example.com, http://localhost:5173",
        )));

        let mut headers = HeaderMap::new();
        cors.apply(
            Some(&HeaderValue::from_static("http://localhost:5173")),
            &mut headers,
        );
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:5173");

        let mut headers = HeaderMap::new();
        cors.apply(Some(&HeaderValue::from_static("https://evil.test")), &mut headers);
        assert!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        // Exact match only
        let mut headers = HeaderMap::new();
        cors.apply(
            Some(&HeaderValue::from_static("https://APP.example.com")),
            &mut headers,
        );
        assert!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn test_parse_origin_policy() {
        assert_eq!(OriginPolicy::parse(None), OriginPolicy::Reflect);
        assert_eq!(OriginPolicy::parse(Some("")), OriginPolicy::Reflect);
        assert_eq!(OriginPolicy::parse(Some(" * ")), OriginPolicy::Reflect);
        assert_eq!(OriginPolicy::parse(Some(" , ")), OriginPolicy::Reflect);
        assert_eq!(
            OriginPolicy::parse(Some("https://a.test,https://b.test")),
            OriginPolicy::AllowList(vec![
                "https://a.test".to_string(),
                "https://b.test".to_string()
            ])
        );
    }

    #[test]
    fn test_preflight_headers() {
        let mut headers = HeaderMap::new();
        CorsPolicy::apply_preflight(&mut headers);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "1728000");
    }
}
