//! Proxy configuration
//! Built once at startup and never mutated afterwards

use crate::cors::OriginPolicy;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Placeholder key shipped as the default; startup warns when it is still in use
pub const DEFAULT_API_KEY: &str = "your-secret-api-key-here";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_PORT: u16 = 3000;
/// 50 MiB
pub const DEFAULT_BODY_LIMIT: u64 = 50 * 1024 * 1024;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The single upstream every request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    /// Parse a base URL such as `http://localhost:11434`.
    /// Any path on the base URL is ignored; callers' paths are forwarded verbatim.
    pub fn parse(base: &str) -> Result<Self> {
        let url = Url::parse(base).with_context(|| format!("Invalid upstream URL: {}", base))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => bail!("Unsupported upstream scheme '{}' in {}", other, base),
        };

        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("Upstream URL has no host: {}", base))?
            .to_string();

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Absolute URL for an inbound path+query
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self, path_and_query)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub api_key: String,
    pub upstream: UpstreamTarget,
    pub origins: OriginPolicy,
    pub body_limit: u64,
    pub upstream_timeout: Duration,
}

impl ProxyConfig {
    /// Reject configurations the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            bail!("API key must not be empty");
        }
        if self.upstream_timeout.is_zero() {
            bail!("Upstream timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.api_key == DEFAULT_API_KEY
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            api_key: DEFAULT_API_KEY.to_string(),
            upstream: UpstreamTarget {
                scheme: Scheme::Http,
                host: "localhost".to_string(),
                port: 11434,
            },
            origins: OriginPolicy::Reflect,
            body_limit: DEFAULT_BODY_LIMIT,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}
