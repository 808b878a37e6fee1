//! Request gating middleware.
//!
//! Order matters and is wired in `server::router`: recovery, request log,
//! request id, IP allow-list, CORS, rate limit, concurrency gate,
//! authentication, handler. `/health` only passes the log and allow-list
//! stages.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::watch;

use super::handlers::error_response;
use super::AppState;

/// Best-effort client address: `X-Forwarded-For`, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        return real_ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Structured request logging.
pub async fn request_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let remote = client_ip(&request);
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        path = %path,
        remote_addr = %remote,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Tag every request and response with a unique id.
pub async fn request_id(request: Request, next: Next) -> Response {
    let id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// A parsed `address/prefix_length` block.
#[derive(Debug, Clone)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(entry: &str) -> Option<Self> {
        let (addr, prefix) = entry.split_once('/')?;
        let network: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (prefix <= max).then_some(Self { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if self.prefix == 0 {
            return matches!(
                (self.network, ip),
                (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
            );
        }
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let shift = 32 - self.prefix as u32;
                u32::from(network) >> shift == u32::from(*ip) >> shift
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let shift = 128 - self.prefix as u32;
                u128::from(network) >> shift == u128::from(*ip) >> shift
            }
            _ => false,
        }
    }
}

/// Strict access control: plain IPs and CIDR blocks.
#[derive(Debug, Default)]
pub struct IpAllowlist {
    enabled: bool,
    exact: HashSet<String>,
    subnets: Vec<Cidr>,
}

impl IpAllowlist {
    pub fn new(enabled: bool, entries: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut subnets = Vec::new();

        for entry in entries {
            if entry.contains('/') {
                match Cidr::parse(entry) {
                    Some(cidr) => subnets.push(cidr),
                    None => tracing::warn!(cidr = %entry, "invalid CIDR in IP whitelist"),
                }
            } else {
                exact.insert(entry.clone());
            }
        }

        Self {
            enabled,
            exact,
            subnets,
        }
    }

    pub fn allows(&self, ip: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.exact.contains(ip) {
            return true;
        }
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.subnets.iter().any(|cidr| cidr.contains(&parsed))
    }
}

pub async fn ip_allowlist(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    if !state.allowlist.allows(&ip) {
        tracing::warn!(ip = %ip, path = request.uri().path(), "IP not in whitelist");
        return error_response(
            StatusCode::FORBIDDEN,
            "Access denied: IP not in whitelist",
            "IP_NOT_WHITELISTED",
        );
    }
    next.run(request).await
}

pub async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let settings = &state.settings.server.cors;
    if !settings.enabled {
        return next.run(request).await;
    }

    let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };

    let allowed = settings
        .origins
        .iter()
        .any(|candidate| candidate == "*" || *candidate == origin);

    let apply = |response: &mut Response| {
        if !allowed {
            return;
        }
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization, X-API-Key"),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        );
    };

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply(&mut response);
        return response;
    }

    let mut response = next.run(request).await;
    apply(&mut response);
    response
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

/// Token-bucket rate limiting per client address.
///
/// Buckets refill continuously at `requests_per_min / 60` tokens per second.
/// A background sweeper evicts buckets idle for more than ten minutes and is
/// stopped explicitly at shutdown.
pub struct RateLimiter {
    enabled: bool,
    requests_per_min: u32,
    whitelist: HashSet<String>,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
    stop: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(enabled: bool, requests_per_min: u32, whitelist: &[String]) -> Self {
        let buckets = Arc::new(Mutex::new(HashMap::new()));
        let (stop, mut stop_rx) = watch::channel(false);

        if enabled {
            let buckets = Arc::clone(&buckets);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let mut buckets = buckets.lock().expect("bucket lock poisoned");
                            Self::evict_idle(&mut buckets, Instant::now());
                        }
                        _ = stop_rx.changed() => return,
                    }
                }
            });
        }

        Self {
            enabled,
            requests_per_min,
            whitelist: whitelist.iter().cloned().collect(),
            buckets,
            stop,
        }
    }

    fn evict_idle(buckets: &mut HashMap<String, TokenBucket>, now: Instant) {
        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) <= BUCKET_IDLE_EVICTION);
    }

    /// Whether a request from `client` is within budget.
    pub fn allow(&self, client: &str) -> bool {
        if !self.enabled || self.whitelist.contains(client) {
            return true;
        }

        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let limit = self.requests_per_min as f64;

        let bucket = buckets.entry(client.to_string()).or_insert(TokenBucket {
            tokens: limit,
            last_update: now,
        });

        let refill = now.duration_since(bucket.last_update).as_secs_f64() * limit / 60.0;
        bucket.tokens = (bucket.tokens + refill).min(limit);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Stop the background sweeper. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    if !state.limiter.allow(&client) {
        tracing::warn!(ip = %client, path = request.uri().path(), "rate limit exceeded");
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
            "RATE_LIMIT_EXCEEDED",
        );
    }
    next.run(request).await
}

/// Counting-semaphore concurrency gate: requests that cannot acquire a slot
/// immediately fail fast instead of queuing.
pub async fn concurrency_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match Arc::clone(&state.gate).try_acquire_owned() {
        Ok(_permit) => next.run(request).await,
        Err(_) => {
            tracing::warn!(
                remote_addr = %client_ip(&request),
                "max concurrent requests reached"
            );
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Server is busy, please try again later",
                "TOO_MANY_REQUESTS",
            )
        }
    }
}

pub async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let settings = &state.settings.server.auth;
    if !settings.enabled {
        return next.run(request).await;
    }

    let supplied = request
        .headers()
        .get(settings.header_key.as_str())
        .and_then(|v| v.to_str().ok());

    match supplied {
        None | Some("") => {
            tracing::warn!(
                remote_addr = %client_ip(&request),
                path = request.uri().path(),
                "missing API key"
            );
            error_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: API key is required",
                "MISSING_API_KEY",
            )
        }
        Some(key) if !state.api_keys.contains(key) => {
            tracing::warn!(
                remote_addr = %client_ip(&request),
                path = request.uri().path(),
                "invalid API key"
            );
            error_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: Invalid API key",
                "INVALID_API_KEY",
            )
        }
        Some(_) => next.run(request).await,
    }
}
