//! ollama-gate - An authenticating reverse proxy for Ollama
//!
//! Sits in front of a local Ollama server and provides:
//! - Bearer token authentication with a shared secret
//! - CORS headers and preflight answers for browser clients
//! - Verbatim forwarding of any method/path/body to one upstream
//! - Streamed relay of upstream responses
//! - Health check endpoint

pub mod auth;
pub mod config;
pub mod cors;
pub mod error;
pub mod proxy;
pub mod relay;

pub use auth::AuthGate;
pub use config::{ProxyConfig, Scheme, UpstreamTarget};
pub use cors::{CorsPolicy, OriginPolicy};
pub use error::{ErrorEnvelope, ProxyError};
pub use proxy::{ProxyBody, ProxyServer};
