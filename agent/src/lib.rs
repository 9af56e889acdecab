//! The per-node agent: a metadata-compatible HTTP server.
//!
//! Pods reach the agent on the node instead of the real metadata endpoint.
//! The credential paths are answered by resolving the calling pod through
//! the broker server (authenticated by source IP) and enforcing that the
//! requested role equals the role annotated on the pod; every other path is
//! reverse-proxied to the configured metadata endpoint untouched.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod metrics;
#[cfg(test)]
mod tests;

pub use self::{
    client::{resolve_role, GrpcBroker, TlsPaths},
    metrics::HandlerMetrics,
};

use anyhow::{Context, Result};
use futures::future;
use hyper::{
    header::{CONTENT_TYPE, HOST},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Response, StatusCode, Uri,
};
use podiam_core::{CredentialsError, CredentialsProvider, LookupError, RoleFinder};
use prometheus_client::registry::Registry;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

/// Per-handler budget; the response is answered before the caller's SDK
/// gives up, even when resolution never completes.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_port: u16,
    pub metadata_endpoint: String,
    /// Honors an `ip` query parameter in place of the source address, on
    /// every handler path. Test and debug use only.
    pub allow_ip_query: bool,
    /// Retry budget for resolving a just-started pod.
    pub max_elapsed_time: Duration,
}

// === impl Config ===

impl Config {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            metadata_endpoint: "http://169.254.169.254".to_string(),
            allow_ip_query: false,
            max_elapsed_time: Duration::from_secs(10),
        }
    }
}

/// Serves the metadata surface until drained.
pub async fn serve<B>(
    config: Config,
    broker: B,
    registry: Registry,
    drain: drain::Watch,
) -> Result<()>
where
    B: RoleFinder + CredentialsProvider + Clone + Send + Sync + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let agent = Arc::new(Agent::new(config, broker, registry)?);

    let server = hyper::server::Server::try_bind(&addr)?.serve(make_service_fn(
        move |conn: &AddrStream| {
            let agent = agent.clone();
            let remote = conn.remote_addr().to_string();
            future::ok::<_, hyper::Error>(service_fn(move |req| {
                let agent = agent.clone();
                let remote = remote.clone();
                async move { Ok::<_, hyper::Error>(agent.handle(req, remote).await) }
            }))
        },
    ));

    info!(%addr, "agent HTTP server listening");
    server
        .with_graceful_shutdown(async move {
            let _release = drain.signaled().await;
        })
        .await?;
    Ok(())
}

enum Route {
    Ping,
    Health,
    Metrics,
    RoleName,
    Credentials(String),
    Proxy,
}

fn route(path: &str) -> Route {
    match path {
        "/ping" => return Route::Ping,
        "/health" => return Route::Health,
        "/metrics" => return Route::Metrics,
        _ => {}
    }

    // /{version}/meta-data/iam/security-credentials[/{role}]
    let mut parts = path.splitn(6, '/').skip(1);
    if parts.next().map_or(true, str::is_empty)
        || parts.next() != Some("meta-data")
        || parts.next() != Some("iam")
        || parts.next() != Some("security-credentials")
    {
        return Route::Proxy;
    }
    match parts.next() {
        None | Some("") => Route::RoleName,
        Some(role) => Route::Credentials(role.to_string()),
    }
}

struct HandlerError {
    status: StatusCode,
    message: String,
}

// === impl HandlerError ===

impl HandlerError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

pub(crate) struct Agent<B> {
    broker: B,
    endpoint: Uri,
    proxy: hyper::Client<hyper::client::HttpConnector>,
    allow_ip_query: bool,
    max_elapsed_time: Duration,
    metrics: HandlerMetrics,
    registry: Arc<Registry>,
}

// === impl Agent ===

impl<B> Agent<B>
where
    B: RoleFinder + CredentialsProvider + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(config: Config, broker: B, mut registry: Registry) -> Result<Self> {
        let endpoint = config
            .metadata_endpoint
            .parse::<Uri>()
            .with_context(|| format!("invalid metadata endpoint {}", config.metadata_endpoint))?;
        let metrics = HandlerMetrics::register(&mut registry);
        Ok(Self {
            broker,
            endpoint,
            proxy: hyper::Client::new(),
            allow_ip_query: config.allow_ip_query,
            max_elapsed_time: config.max_elapsed_time,
            metrics,
            registry: Arc::new(registry),
        })
    }

    pub(crate) async fn handle(&self, req: Request<Body>, remote: String) -> Response<Body> {
        match route(req.uri().path()) {
            Route::Ping => {
                self.metrics.observe("ping", StatusCode::OK);
                text(StatusCode::OK, "pong")
            }
            Route::Metrics => self.metrics_exposition(),
            Route::Health => self.handled("health", self.health()).await,
            Route::RoleName => {
                self.handled("roleName", self.role_name(req, remote)).await
            }
            Route::Credentials(role) => {
                self.handled("credentials", self.credentials(req, remote, role))
                    .await
            }
            Route::Proxy => self.handled("proxy", self.proxy(req)).await,
        }
    }

    /// Applies the handler deadline, records the response class, and turns
    /// errors into plain-text responses. Credentials never appear in error
    /// bodies.
    async fn handled<F>(&self, name: &'static str, handler: F) -> Response<Body>
    where
        F: std::future::Future<Output = Result<Response<Body>, HandlerError>>,
    {
        let result = match tokio::time::timeout(HANDLER_TIMEOUT, handler).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::internal("request deadline exceeded")),
        };
        match result {
            Ok(resp) => {
                self.metrics.observe(name, resp.status());
                resp
            }
            Err(error) => {
                warn!(
                    handler = name,
                    status = %error.status,
                    "error processing request: {}",
                    error.message
                );
                self.metrics.observe(name, error.status);
                text(error.status, error.message)
            }
        }
    }

    async fn role_name(
        &self,
        req: Request<Body>,
        remote: String,
    ) -> Result<Response<Body>, HandlerError> {
        let ip = self.client_ip(&req, &remote)?;
        let role = self.resolve_role(ip).await?;
        Ok(text(StatusCode::OK, role))
    }

    async fn credentials(
        &self,
        req: Request<Body>,
        remote: String,
        requested: String,
    ) -> Result<Response<Body>, HandlerError> {
        if requested.is_empty() {
            return Err(HandlerError::new(
                StatusCode::BAD_REQUEST,
                "no role specified",
            ));
        }

        let ip = self.client_ip(&req, &remote)?;
        let resolved = self.resolve_role(ip).await?;
        if resolved != requested {
            return Err(HandlerError::new(
                StatusCode::FORBIDDEN,
                format!(
                    "unable to assume role {requested}, role on pod specified is {resolved}"
                ),
            ));
        }

        let creds = self
            .broker
            .credentials_for_role(&requested)
            .await
            .map_err(|error| match error {
                error @ CredentialsError::Policy { .. } => {
                    HandlerError::internal(error.to_string())
                }
                CredentialsError::Transient(message) => HandlerError::internal(message),
            })?;

        let body = serde_json::to_vec(&creds)
            .map_err(|error| HandlerError::internal(format!("error encoding credentials: {error}")))?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap())
    }

    /// Runs the bounded retry on its own task so that a handler deadline
    /// abandons the resolution instead of waiting for it.
    async fn resolve_role(&self, ip: IpAddr) -> Result<String, HandlerError> {
        let broker = self.broker.clone();
        let budget = self.max_elapsed_time;
        let resolution =
            tokio::spawn(async move { client::resolve_role(&broker, ip, budget).await });

        match resolution.await {
            Ok(Ok(Some(role))) => Ok(role),
            Ok(Ok(None)) => Err(HandlerError::new(
                StatusCode::NOT_FOUND,
                format!("pod not found for ip {ip}"),
            )),
            Ok(Err(LookupError::Forbidden(message))) => {
                Err(HandlerError::new(StatusCode::FORBIDDEN, message))
            }
            Ok(Err(LookupError::Unavailable(message))) => Err(HandlerError::internal(format!(
                "error finding role for ip {ip}: {message}"
            ))),
            Err(error) => Err(HandlerError::internal(format!(
                "resolution task failed: {error}"
            ))),
        }
    }

    async fn health(&self) -> Result<Response<Body>, HandlerError> {
        let uri = endpoint_uri(&self.endpoint, "/latest")?;
        match self.proxy.get(uri).await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                Ok(text(StatusCode::OK, "ok"))
            }
            Ok(resp) => Err(HandlerError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("metadata endpoint returned {}", resp.status()),
            )),
            Err(error) => Err(HandlerError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("metadata endpoint unreachable: {error}"),
            )),
        }
    }

    async fn proxy(&self, mut req: Request<Body>) -> Result<Response<Body>, HandlerError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        *req.uri_mut() = endpoint_uri(&self.endpoint, path)?;
        req.headers_mut().remove(HOST);

        self.proxy.request(req).await.map_err(|error| {
            HandlerError::new(
                StatusCode::BAD_GATEWAY,
                format!("error proxying to metadata endpoint: {error}"),
            )
        })
    }

    fn metrics_exposition(&self) -> Response<Body> {
        let mut buf = String::new();
        match prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            Ok(()) => Response::builder()
                .status(StatusCode::OK)
                .header(
                    CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )
                .body(buf.into())
                .unwrap(),
            Err(_) => text(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed"),
        }
    }

    fn client_ip(&self, req: &Request<Body>, remote: &str) -> Result<IpAddr, HandlerError> {
        if self.allow_ip_query {
            if let Some(ip) = query_param(req.uri().query().unwrap_or(""), "ip") {
                return ip.parse().map_err(|_| {
                    HandlerError::internal(format!("error parsing client ip {ip}"))
                });
            }
        }
        parse_client_ip(remote)
            .map_err(|error| HandlerError::internal(format!("error parsing client ip: {error}")))
    }
}

/// Extracts the IP from an `ip:port` remote address. IPv6 addresses arrive
/// bracketed (`[::1]:port`).
fn parse_client_ip(addr: &str) -> Result<IpAddr, String> {
    let (host, _port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("incorrect format, expected ip:port, was: {addr}"))?;
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| format!("invalid ip in address {addr}"))
}

fn query_param<'q>(query: &'q str, name: &str) -> Option<&'q str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn endpoint_uri(endpoint: &Uri, path: &str) -> Result<Uri, HandlerError> {
    let mut parts = endpoint.clone().into_parts();
    parts.path_and_query = Some(
        path.parse()
            .map_err(|_| HandlerError::internal(format!("invalid path {path}")))?,
    );
    Uri::from_parts(parts)
        .map_err(|error| HandlerError::internal(format!("error building upstream uri: {error}")))
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(body.into())
        .unwrap()
}
