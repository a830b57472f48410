use std::future::Future;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ApiConfig;
use crate::errors::ApiError;
use crate::feature_flags::feature_flag_middleware;
use crate::idempotency::interceptor::idempotency_middleware;
use crate::ledger::Transaction;
use crate::runtime::LedgerRuntime;

#[derive(Clone)]
struct AppState {
    runtime: LedgerRuntime,
}

/// Feature flags run outermost, so a disabled endpoint never reaches the
/// idempotency layer.
pub fn router(runtime: LedgerRuntime) -> Router {
    let interceptor = runtime.interceptor();
    let flags = runtime.feature_flags();

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/transactions",
            get(list_transactions_handler).post(create_transaction_handler),
        )
        .with_state(AppState { runtime })
        .layer(from_fn_with_state(interceptor, idempotency_middleware))
        .layer(from_fn_with_state(flags, feature_flag_middleware))
}

/// Format a host+port into a bind address string.
///
/// IPv6 addresses must be wrapped in brackets so the port is unambiguous:
/// `::1` → `[::1]:8080`. Already-bracketed hosts (e.g. `[::1]`) are left
/// as-is to prevent double-wrapping. IPv4 and hostnames are unchanged.
pub(crate) fn bind_addr_string(host: &str, port: u16) -> String {
    let trimmed = host.trim();
    if trimmed.starts_with('[') {
        format!("{trimmed}:{port}")
    } else if trimmed.contains(':') {
        format!("[{trimmed}]:{port}")
    } else {
        format!("{trimmed}:{port}")
    }
}

pub async fn serve(config: ApiConfig) -> Result<()> {
    let bind_address = bind_addr_string(&config.host, config.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed binding listener at {bind_address}"))?;

    info!(
        address = %bind_address,
        idempotency_store = config.idempotency_store.as_str(),
        "starting ledger-api server"
    );

    let runtime = LedgerRuntime::new(config)?;
    serve_with_listener(listener, runtime, shutdown_signal()).await
}

/// Serves until `shutdown` resolves, running the expiry sweeper alongside.
pub async fn serve_with_listener<F>(
    listener: TcpListener,
    runtime: LedgerRuntime,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .context("failed to read listener local_addr")?;
    info!(%local_addr, "ledger-api listening");

    let sweeper = runtime.sweeper();
    info!(
        interval_secs = sweeper.interval().as_secs(),
        "starting idempotency sweeper"
    );
    let sweeper_shutdown = CancellationToken::new();
    let sweeper_handle = sweeper.spawn(sweeper_shutdown.clone());

    let served = axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await
        .context("axum server terminated with error");

    sweeper_shutdown.cancel();
    if let Err(error) = sweeper_handle.await {
        warn!(%error, "idempotency sweeper did not stop cleanly");
    }

    served
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(state.runtime.health_payload())
}

async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    Json(state.runtime.metrics_payload())
}

async fn create_transaction_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Transaction>, ApiError> {
    state.runtime.create_transaction(&body).map(Json)
}

async fn list_transactions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    state.runtime.list_transactions().map(Json)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed waiting for ctrl-c shutdown signal");
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use super::{bind_addr_string, router};
    use crate::config::ApiConfig;
    use crate::runtime::LedgerRuntime;

    const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";
    const OFFICE_SUPPLIES: &str =
        r#"{"amount":100.00,"description":"Office supplies","type":"EXPENSE"}"#;

    fn post_transactions(key: Option<&str>, body: impl Into<Body>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/transactions")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("idempotency-key", key);
        }
        builder.body(body.into()).expect("request should build")
    }

    #[tokio::test]
    async fn oversized_bodies_get_413_with_or_without_a_key() {
        let app = router(LedgerRuntime::new(ApiConfig::default()).expect("runtime should build"));
        let oversized = vec![b'a'; 3 * 1024 * 1024];

        let keyless = app
            .clone()
            .oneshot(post_transactions(None, oversized.clone()))
            .await
            .expect("router is infallible");
        assert_eq!(keyless.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let keyed = app
            .clone()
            .oneshot(post_transactions(Some(KEY), oversized))
            .await
            .expect("router is infallible");
        assert_eq!(keyed.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // The rejected request must not have reserved the key.
        let follow_up = app
            .oneshot(post_transactions(Some(KEY), OFFICE_SUPPLIES))
            .await
            .expect("router is infallible");
        assert_eq!(follow_up.status(), StatusCode::OK);
    }

    #[test]
    fn ipv4_loopback_formats_without_brackets() {
        assert_eq!(bind_addr_string("127.0.0.1", 8080), "127.0.0.1:8080");
    }

    #[test]
    fn hostname_formats_without_brackets() {
        assert_eq!(bind_addr_string("localhost", 8080), "localhost:8080");
    }

    #[test]
    fn ipv6_loopback_wraps_in_brackets() {
        assert_eq!(bind_addr_string("::1", 8080), "[::1]:8080");
    }

    #[test]
    fn ipv6_full_address_wraps_in_brackets() {
        assert_eq!(bind_addr_string("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[test]
    fn pre_bracketed_ipv6_does_not_double_wrap() {
        assert_eq!(bind_addr_string("[::1]", 8080), "[::1]:8080");
    }
}
