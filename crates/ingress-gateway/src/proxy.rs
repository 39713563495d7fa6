//! Path-rewriting reverse proxy.
//!
//! Forwards every request on the public port to the internal app server.
//! `text/html` responses are buffered and rewritten when the ingress supplied
//! a path prefix; everything else, including upgraded connections, streams
//! through untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri,
        header::{
            CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
            TRANSFER_ENCODING, UPGRADE,
        },
    },
    response::IntoResponse,
};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::rewrite;

pub type HttpClient = Client<HttpConnector, Body>;

/// Served with `502` while the app server is unreachable. Reloads itself so
/// the page recovers once the app has started.
pub const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="5">
<title>Starting…</title>
</head>
<body>
<p>The application is starting. This page reloads automatically.</p>
<script>setTimeout(function () { window.location.reload(); }, 5000);</script>
</body>
</html>
"#;

#[derive(Clone)]
pub struct ProxyState {
    client: HttpClient,
    config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and run until `shutdown` fires.
pub async fn serve(config: ProxyConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding proxy listener on {addr}"))?;
    serve_listener(listener, config, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    config: ProxyConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("reading proxy listener address")?;
    info!(
        "Ingress proxy listening on {}, forwarding to {}",
        addr,
        config.upstream_authority()
    );

    let app = router(ProxyState::new(config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("proxy server error")?;

    info!("Ingress proxy stopped");
    Ok(())
}

async fn forward(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match forward_request(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            error!("Proxy {} {} failed: {}", method, path, err);
            err.into_response()
        }
    }
}

async fn forward_request(
    state: &ProxyState,
    mut req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let config = state.config();
    let prefix = req
        .headers()
        .get(config.ingress_header.as_str())
        .and_then(|value| value.to_str().ok())
        .and_then(rewrite::normalize_prefix);

    debug!(
        "Proxy {} {} (ingress prefix: {:?})",
        req.method(),
        req.uri(),
        prefix
    );

    let client_upgrade = is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let authority = config.upstream_authority();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{authority}{path_and_query}").parse()?;

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    headers.insert(HOST, HeaderValue::from_str(&authority)?);

    // A consumed body cannot be sent again, so only bodyless requests retry.
    let policy = if has_body(&headers) {
        RetryPolicy::single()
    } else {
        RetryPolicy {
            attempts: config.connect_attempts,
            delay: config.retry_delay(),
        }
    };

    let client = state.client.clone();
    let mut body = Some(body);
    let mut response = retry_on_connect(
        policy,
        |attempt| {
            let mut forwarded = Request::new(body.take().unwrap_or_else(Body::empty));
            *forwarded.method_mut() = parts.method.clone();
            *forwarded.uri_mut() = uri.clone();
            *forwarded.headers_mut() = headers.clone();
            if attempt > 1 {
                debug!("Retrying {} (attempt {})", uri, attempt);
            }
            client.request(forwarded)
        },
        |err| err.is_connect(),
    )
    .await
    .map_err(|exhausted| ProxyError::Upstream {
        attempts: exhausted.attempts,
        source: exhausted.error,
    })?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_upgrade, upstream_upgrade));
        }
        return Ok(into_axum_response(response));
    }

    let Some(prefix) = prefix else {
        return Ok(into_axum_response(response));
    };
    // HEAD responses advertise the length of a body they do not carry.
    if parts.method == Method::HEAD {
        return Ok(into_axum_response(response));
    }
    if !is_html_response(response.headers()) {
        return Ok(into_axum_response(response));
    }
    if let Some(encoding) = encoded_with(response.headers()) {
        warn!(
            "Not rewriting {} response for {}: upstream content-encoding {}",
            response.status(),
            uri,
            encoding
        );
        return Ok(into_axum_response(response));
    }

    rewrite_response(response, &prefix).await
}

fn into_axum_response(response: Response<Incoming>) -> Response<Body> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(body))
}

/// Buffer an HTML response, apply the prefix and fix the framing headers.
async fn rewrite_response(
    response: Response<Incoming>,
    prefix: &str,
) -> Result<Response<Body>, ProxyError> {
    let (mut parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    let html = String::from_utf8(bytes.to_vec())?;
    let rewritten = rewrite::rewrite_html(&html, prefix);

    debug!(
        "Rewrote HTML for prefix {} ({} -> {} bytes)",
        prefix,
        html.len(),
        rewritten.len()
    );

    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    Ok(Response::from_parts(parts, Body::from(rewritten)))
}

/// Join the client and upstream connections once both sides have switched
/// protocols.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("Upgrade failed: {}", err);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => debug!(
            "Upgraded connection closed ({} bytes up, {} bytes down)",
            to_upstream, to_client
        ),
        Err(err) => debug!("Upgraded connection ended: {}", err),
    }
}

/// `502` response carrying [`FALLBACK_PAGE`].
pub fn fallback_response() -> Response<Body> {
    (
        StatusCode::BAD_GATEWAY,
        [
            (CONTENT_TYPE, "text/html; charset=utf-8"),
            (CACHE_CONTROL, "no-store"),
        ],
        FALLBACK_PAGE,
    )
        .into_response()
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value.to_str().is_ok_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
    });
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Whether the request carries a body that would be consumed by sending it.
fn has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .is_some_and(|length| length > 0)
}

fn is_html_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(rewrite::is_html)
}

/// The upstream content-encoding, unless it is absent or `identity`.
fn encoded_with(headers: &HeaderMap) -> Option<String> {
    let encoding = headers.get(CONTENT_ENCODING)?.to_str().unwrap_or("unknown").trim();
    if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") {
        None
    } else {
        Some(encoding.to_string())
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Total attempts and the fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn single() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// The last error after every allowed attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// Run `attempt` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy runs out of attempts. Attempts are numbered from 1.
pub async fn retry_on_connect<T, E, F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(attempts).await {
            Ok(value) => return Ok(value),
            Err(error) if attempts < max_attempts && is_retryable(&error) => {
                debug!(
                    "Upstream not reachable (attempt {}/{}): {}; retrying in {:?}",
                    attempts, max_attempts, error, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(error) => return Err(Exhausted { attempts, error }),
        }
    }
}
