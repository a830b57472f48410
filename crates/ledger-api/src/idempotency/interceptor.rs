//! Request interception for the idempotency protocol.
//!
//! For an in-scope request carrying `Idempotency-Key`:
//!
//! 1. reject malformed keys with 400 before touching the store,
//! 2. fingerprint the buffered body,
//! 3. replay a cached response for the same `(key, fingerprint)`,
//! 4. answer 409 when the key is live under another fingerprint,
//! 5. otherwise claim the pair, run the downstream handler once, and cache a
//!    cacheable result.
//!
//! Requests without the header pass through untouched.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{FromRequest, Request, State};
use axum::http::response::Parts;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    CachedResponse, ClaimOutcome, ClaimToken, Fingerprint, IdempotencyStore, StoreError,
    is_valid_key,
};
use crate::config::{ApiConfig, CacheableStatus};
use crate::errors::ApiError;
use crate::metrics::{IDEMPOTENCY_CACHE_HITS, IDEMPOTENCY_REQUESTS_TOTAL, MetricsSink};

/// Header names are matched case-insensitively; these are the wire spellings
/// in lower case.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

const DEFAULT_CONTENT_TYPE: &str = "application/json";
const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// A downstream response with its body fully buffered, so it can be both
/// cached and released to the client.
#[derive(Debug)]
pub struct CapturedResponse {
    parts: Parts,
    body: Bytes,
}

impl CapturedResponse {
    pub fn new(status: StatusCode, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        let (mut parts, ()) = axum::http::Response::new(()).into_parts();
        parts.status = status;
        if let Some(value) = content_type.and_then(|value| HeaderValue::from_str(value).ok()) {
            parts.headers.insert(header::CONTENT_TYPE, value);
        }

        Self {
            parts,
            body: body.into(),
        }
    }

    pub async fn from_response(response: Response) -> Result<Self, ApiError> {
        let (parts, body) = response.into_parts();
        let body = to_bytes(body, usize::MAX).await.map_err(|error| {
            ApiError::internal(format!("failed buffering downstream response: {error}"))
        })?;
        Ok(Self { parts, body })
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    fn to_cached(&self) -> CachedResponse {
        let content_type = self
            .parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        CachedResponse::new(self.parts.status.as_u16(), content_type, self.body.to_vec())
    }
}

impl IntoResponse for CapturedResponse {
    fn into_response(self) -> Response {
        Response::from_parts(self.parts, Body::from(self.body))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyHeader<'a> {
    Absent,
    Malformed,
    Valid(&'a str),
}

fn classify(header: Option<&HeaderValue>) -> KeyHeader<'_> {
    let Some(value) = header else {
        return KeyHeader::Absent;
    };

    match value.to_str() {
        Ok(key) if key.trim().is_empty() => KeyHeader::Absent,
        Ok(key) if is_valid_key(key) => KeyHeader::Valid(key),
        _ => KeyHeader::Malformed,
    }
}

#[derive(Clone)]
pub struct IdempotencyInterceptor {
    store: Arc<dyn IdempotencyStore>,
    metrics: Arc<dyn MetricsSink>,
    endpoints: Arc<HashSet<(Method, String)>>,
    cacheable: CacheableStatus,
    in_flight_wait: Duration,
}

impl IdempotencyInterceptor {
    pub fn new(store: Arc<dyn IdempotencyStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            endpoints: Arc::new(HashSet::from([(Method::POST, "/transactions".to_string())])),
            cacheable: CacheableStatus::OkOnly,
            in_flight_wait: Duration::from_secs(5),
        }
    }

    pub fn from_config(
        config: &ApiConfig,
        store: Arc<dyn IdempotencyStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::new(store, metrics)
            .with_endpoints(config.idempotent_endpoints.iter().map(String::as_str))
            .with_cacheable(config.idempotency_cacheable)
            .with_in_flight_wait(Duration::from_millis(config.idempotency_in_flight_wait_ms))
    }

    /// Replaces the endpoint set with `"METHOD /path"` entries.
    pub fn with_endpoints<'a>(mut self, endpoints: impl IntoIterator<Item = &'a str>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .filter_map(|endpoint| {
                let parsed = endpoint.split_once(' ').and_then(|(method, path)| {
                    Method::from_bytes(method.trim().as_bytes())
                        .ok()
                        .map(|method| (method, path.trim().to_string()))
                });
                if parsed.is_none() {
                    warn!(endpoint, "ignoring malformed idempotent endpoint");
                }
                parsed
            })
            .collect();
        self.endpoints = Arc::new(endpoints);
        self
    }

    pub fn with_cacheable(mut self, cacheable: CacheableStatus) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_in_flight_wait(mut self, in_flight_wait: Duration) -> Self {
        self.in_flight_wait = in_flight_wait;
        self
    }

    pub fn in_scope(&self, method: &Method, path: &str) -> bool {
        self.endpoints.contains(&(method.clone(), path.to_string()))
    }

    /// Runs the protocol around `downstream`, which receives the buffered
    /// request body and is invoked at most once.
    pub async fn process<F, Fut>(
        &self,
        method: &Method,
        path: &str,
        key_header: Option<&HeaderValue>,
        body: Bytes,
        downstream: F,
    ) -> Response
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<CapturedResponse, ApiError>>,
    {
        if !self.in_scope(method, path) {
            return downstream(body).await.into_response();
        }

        let key = match classify(key_header) {
            KeyHeader::Absent => return downstream(body).await.into_response(),
            KeyHeader::Malformed => {
                debug!(%method, path, "rejecting malformed idempotency key");
                return ApiError::invalid_idempotency_key().into_response();
            }
            KeyHeader::Valid(key) => key,
        };

        self.metrics.increment(IDEMPOTENCY_REQUESTS_TOTAL);
        let fingerprint = Fingerprint::of(&body);

        match self.engage(key, &fingerprint, body, downstream).await {
            Ok(response) => response,
            Err(error) => error.into_response(),
        }
    }

    async fn engage<F, Fut>(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        body: Bytes,
        downstream: F,
    ) -> Result<Response, ApiError>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<CapturedResponse, ApiError>>,
    {
        let fingerprint = fingerprint.as_str();

        if let Some(cached) = self
            .store
            .lookup(key, fingerprint)
            .await
            .map_err(|error| store_failure("lookup", error))?
        {
            return Ok(self.replay(key, cached));
        }

        if self
            .store
            .has_conflict(key, fingerprint)
            .await
            .map_err(|error| store_failure("has_conflict", error))?
        {
            info!(key, "idempotency key reused with a different request body");
            return Err(ApiError::idempotency_conflict());
        }

        let token = match self.claim(key, fingerprint).await? {
            Claim::Held(token) => token,
            Claim::Replay(cached) => return Ok(self.replay(key, cached)),
        };

        let captured = match downstream(body).await {
            Ok(captured) => captured,
            Err(error) => {
                self.release(key, fingerprint, token).await;
                return Err(error);
            }
        };

        let status = captured.status().as_u16();
        if !self.cacheable.allows(status) {
            debug!(key, status, "downstream status is not cacheable");
            self.release(key, fingerprint, token).await;
            return Ok(captured.into_response());
        }

        // The side effect already happened, so the response goes back either way.
        match self
            .store
            .complete(key, fingerprint, token, captured.to_cached())
            .await
        {
            Ok(true) => debug!(key, status, "cached idempotent response"),
            Ok(false) => warn!(key, status, "claim was taken over; response not cached"),
            Err(error) => {
                error!(key, %error, "failed caching idempotent response");
                self.release(key, fingerprint, token).await;
            }
        }

        Ok(captured.into_response())
    }

    /// Reserves the pair for this request, waiting out a concurrent holder
    /// for at most `in_flight_wait`.
    async fn claim(&self, key: &str, fingerprint: &str) -> Result<Claim, ApiError> {
        let deadline = Instant::now() + self.in_flight_wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self
                .store
                .try_claim(key, fingerprint)
                .await
                .map_err(|error| store_failure("try_claim", error))?
            {
                ClaimOutcome::Acquired(token) => return Ok(Claim::Held(token)),
                ClaimOutcome::Completed(cached) => return Ok(Claim::Replay(cached)),
                ClaimOutcome::Conflict => {
                    info!(key, "idempotency key claimed with a different request body");
                    return Err(ApiError::idempotency_conflict());
                }
                ClaimOutcome::InFlight => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(key, "idempotent request still in flight; asking client to retry");
                        return Err(ApiError::request_in_flight());
                    }
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn release(&self, key: &str, fingerprint: &str, token: ClaimToken) {
        if let Err(error) = self.store.release(key, fingerprint, token).await {
            warn!(key, %error, "failed releasing idempotency claim");
        }
    }

    fn replay(&self, key: &str, cached: CachedResponse) -> Response {
        self.metrics.increment(IDEMPOTENCY_CACHE_HITS);
        debug!(key, status = cached.status, "replaying cached idempotent response");

        let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
        let content_type = cached
            .content_type
            .as_deref()
            .and_then(|value| HeaderValue::from_str(value).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        let mut response = (status, cached.body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
        response
    }
}

enum Claim {
    Held(ClaimToken),
    Replay(CachedResponse),
}

fn store_failure(operation: &'static str, error: StoreError) -> ApiError {
    error!(operation, %error, "idempotency store failed during request");
    ApiError::from(error)
}

/// Axum adapter: buffers the request body once, hands it to both the
/// fingerprinting step and the inner service, and buffers the response.
pub async fn idempotency_middleware(
    State(interceptor): State<IdempotencyInterceptor>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let key_header = request.headers().get(IDEMPOTENCY_KEY_HEADER).cloned();

    if key_header.is_none() || !interceptor.in_scope(&method, &path) {
        return next.run(request).await;
    }

    // Buffer through the `Bytes` extractor so size limits and their 413
    // match what the handler would have produced without the header.
    let (parts, body) = request.into_parts();
    let body = match Bytes::from_request(Request::new(body), &()).await {
        Ok(body) => body,
        Err(rejection) => {
            warn!(%rejection, "failed buffering idempotent request body");
            return rejection.into_response();
        }
    };

    interceptor
        .process(&method, &path, key_header.as_ref(), body, move |body| async move {
            let response = next.run(Request::from_parts(parts, Body::from(body))).await;
            CapturedResponse::from_response(response).await
        })
        .await
}
