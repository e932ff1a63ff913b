//! Proxy server implementation
//! CORS → auth → health or forward to the Ollama upstream, streaming both bodies

use crate::auth::AuthGate;
use crate::config::ProxyConfig;
use crate::cors::{CorsPolicy, UPSTREAM_SKIPPED};
use crate::error::{BoxError, ProxyError};
use crate::relay::{RelayStream, RequestBodyStream};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited, StreamBody};
use hyper::body::{Body, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE,
    HOST, ORIGIN, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Response body type for everything the proxy answers with
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub const HEALTH_PATH: &str = "/health";
pub const POWERED_BY: &str = "Ollama-Proxy";

const INTERNAL_ERROR_BODY: &[u8] =
    br#"{"error":{"message":"Internal server error","type":"server_error"}}"#;

const X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    message: &'static str,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    auth: AuthGate,
    cors: CorsPolicy,
    client: reqwest::Client,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        // Redirects and environment proxies are the caller's business, not ours
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .read_timeout(config.upstream_timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            auth: AuthGate::new(&config.api_key),
            cors: CorsPolicy::new(config.origins.clone()),
            config,
            client,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the configured port and serve until the task is dropped
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("Ollama proxy server started on port {}", self.config.port);
        info!("Proxying requests to {}", self.config.upstream);

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req: Request<Incoming>| {
                    let server = self.clone();
                    let span = info_span!(
                        "request",
                        id = %Uuid::new_v4(),
                        client = %remote_addr
                    );
                    async move { Ok::<_, Infallible>(server.handle(req).await) }.instrument(span)
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Answer one request. Failures become error envelopes, never `Err`.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self::log_request(&req);

        let mut headers = HeaderMap::new();
        self.cors.apply(req.headers().get(ORIGIN), &mut headers);

        if req.method() == Method::OPTIONS {
            CorsPolicy::apply_preflight(&mut headers);
            let mut response = Self::empty_response(StatusCode::NO_CONTENT);
            *response.headers_mut() = headers;
            return response;
        }

        let mut response = match self.route(req).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::Unauthorized => warn!("Rejected request with invalid credentials"),
                    ProxyError::PayloadTooLarge { .. } => warn!("{}", e),
                    ProxyError::Connection(_) => {
                        error!("Error forwarding request to Ollama: {}", e)
                    }
                }
                Self::error_response(&e)
            }
        };

        // What the handler produced wins over the CORS defaults, key by key
        headers.extend(std::mem::take(response.headers_mut()));
        *response.headers_mut() = headers;
        response
    }

    async fn route<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.auth.check(req.headers())?;

        if Self::is_health_check(&req) {
            return Ok(Self::json_response(
                StatusCode::OK,
                &HealthStatus {
                    status: "ok",
                    message: "Ollama proxy is running",
                },
            ));
        }

        self.forward(req).await
    }

    /// Send the request upstream and relay the response as it arrives
    async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let limit = self.config.body_limit;
        if let Some(declared) = Self::declared_length(&parts.headers) {
            if declared > limit {
                return Err(ProxyError::PayloadTooLarge { limit });
            }
        }

        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = self.config.upstream.url_for(path_and_query);
        let mut headers = Self::forward_headers(&parts.headers);

        let attach_body = parts.method != Method::GET && !body.is_end_stream();
        if !attach_body {
            // Nothing follows the headers, so nothing may be announced
            headers.remove(CONTENT_LENGTH);
        }

        debug!(
            url = %url,
            headers = ?headers.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            "Forwarding {} request to Ollama",
            parts.method
        );

        let mut outbound = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers);

        let (uploaded_tx, uploaded) = oneshot::channel::<()>();
        if attach_body {
            let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
            let stream = RequestBodyStream::new(limited, parts.method == Method::POST)
                .with_end_signal(uploaded_tx);
            outbound = outbound.body(reqwest::Body::wrap_stream(stream));
        } else {
            drop(uploaded_tx);
        }

        // The clock starts once the request body is handed over, so a slow upload
        // is not charged to the upstream. Body inactivity while relaying is bounded
        // by the client's read timeout.
        let timeout = self.config.upstream_timeout;
        let send = outbound.send();
        tokio::pin!(send);
        let outcome = tokio::select! {
            sent = &mut send => Ok(sent),
            _ = uploaded => tokio::time::timeout(timeout, &mut send).await,
        };
        let upstream = match outcome {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => return Err(ProxyError::connection(&e)),
            Err(_) => {
                return Err(ProxyError::Connection(format!(
                    "no response within {}s",
                    timeout.as_secs_f64()
                )))
            }
        };

        info!(status = upstream.status().as_u16(), "Received response from Ollama");
        debug!(
            headers = ?upstream.headers().keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            "Upstream response headers"
        );

        let status = upstream.status();
        let mut headers = HeaderMap::new();
        Self::relay_headers(upstream.headers(), &mut headers);
        headers.insert(X_POWERED_BY, HeaderValue::from_static(POWERED_BY));

        let body = StreamBody::new(RelayStream::new(upstream.bytes_stream())).boxed_unsync();

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    fn log_request<B>(req: &Request<B>) {
        let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        info!("{} {}", req.method(), path_and_query);

        if req.method() == Method::POST {
            let header = |name: HeaderName| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string()
            };
            debug!("POST REQUEST DETAILS:");
            debug!("  Content-Type: {}", header(CONTENT_TYPE));
            debug!("  Content-Length: {} bytes", header(CONTENT_LENGTH));
        }
    }

    /// `GET` or `HEAD` on `/health`, with or without a trailing slash, any case
    fn is_health_check<B>(req: &Request<B>) -> bool {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return false;
        }
        let path = req.uri().path();
        let path = path.strip_suffix('/').unwrap_or(path);
        path.eq_ignore_ascii_case(HEALTH_PATH)
    }

    fn declared_length(headers: &HeaderMap) -> Option<u64> {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Inbound headers minus credentials, `host` and connection-level headers
    fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(inbound.len());

        for (name, value) in inbound.iter() {
            if Self::is_dropped_on_forward(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        headers
    }

    fn is_dropped_on_forward(name: &HeaderName) -> bool {
        name == HOST
            || name == AUTHORIZATION
            || name == PROXY_AUTHORIZATION
            || name == CONNECTION
            || name == TE
            || name == TRAILER
            || name == TRANSFER_ENCODING
            || name == UPGRADE
            || name == KEEP_ALIVE
            || name == PROXY_CONNECTION
    }

    /// Upstream headers minus the CORS keys the proxy owns
    fn relay_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
        for (name, value) in upstream.iter() {
            if UPSTREAM_SKIPPED.contains(name) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    }

    fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
        let (status, body) = match serde_json::to_vec(value) {
            Ok(body) => (status, Bytes::from(body)),
            Err(e) => {
                error!("Failed to encode response body: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, Bytes::from_static(INTERNAL_ERROR_BODY))
            }
        };

        let mut response = Response::new(Self::full_body(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        response
    }

    /// Create error response
    fn error_response(err: &ProxyError) -> Response<ProxyBody> {
        Self::json_response(err.status(), &err.envelope())
    }

    fn empty_response(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(Self::empty_body());
        *response.status_mut() = status;
        response
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync()
    }
}
