use std::collections::BTreeMap;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::config::ApiConfig;
use crate::errors::ApiError;

pub const CREATE_TRANSACTION: &str = "create-transaction";
pub const GET_ALL_TRANSACTIONS: &str = "get-all-transactions";

/// Maps an endpoint to the feature that gates it.
pub fn feature_for(method: &Method, path: &str) -> Option<&'static str> {
    if path != "/transactions" {
        return None;
    }

    if *method == Method::POST {
        Some(CREATE_TRANSACTION)
    } else if *method == Method::GET {
        Some(GET_ALL_TRANSACTIONS)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    flags: BTreeMap<&'static str, bool>,
}

impl FeatureFlags {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            flags: BTreeMap::from([
                (CREATE_TRANSACTION, config.create_transaction_enabled),
                (GET_ALL_TRANSACTIONS, config.get_all_transactions_enabled),
            ]),
        }
    }

    /// Unknown features are enabled.
    pub fn is_enabled(&self, feature: &str) -> bool {
        self.flags.get(feature).copied().unwrap_or(true)
    }

    pub fn require_enabled(&self, method: &Method, path: &str) -> Result<(), ApiError> {
        match feature_for(method, path) {
            Some(feature) if !self.is_enabled(feature) => {
                info!(feature, %method, path, "rejecting request for disabled feature");
                Err(ApiError::feature_disabled())
            }
            _ => Ok(()),
        }
    }
}

pub async fn feature_flag_middleware(
    State(flags): State<FeatureFlags>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(error) = flags.require_enabled(request.method(), request.uri().path()) {
        return error.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::{CREATE_TRANSACTION, FeatureFlags, GET_ALL_TRANSACTIONS, feature_for};
    use crate::config::ApiConfig;

    #[test]
    fn maps_transaction_endpoints_to_features() {
        assert_eq!(
            feature_for(&Method::POST, "/transactions"),
            Some(CREATE_TRANSACTION)
        );
        assert_eq!(
            feature_for(&Method::GET, "/transactions"),
            Some(GET_ALL_TRANSACTIONS)
        );
        assert_eq!(feature_for(&Method::GET, "/health"), None);
    }

    #[test]
    fn disabled_features_are_forbidden() {
        let mut config = ApiConfig::default();
        config.create_transaction_enabled = false;
        let flags = FeatureFlags::from_config(&config);

        let error = flags
            .require_enabled(&Method::POST, "/transactions")
            .expect_err("create should be gated");
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.message, "Feature is disabled");

        assert!(flags.require_enabled(&Method::GET, "/transactions").is_ok());
        assert!(flags.require_enabled(&Method::GET, "/health").is_ok());
        assert!(flags.is_enabled("unknown-feature"));
    }
}
