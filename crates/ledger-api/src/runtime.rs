use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::info;

use crate::config::ApiConfig;
use crate::errors::ApiError;
use crate::feature_flags::FeatureFlags;
use crate::idempotency::{self, ExpirySweeper, IdempotencyInterceptor, IdempotencyStore};
use crate::ledger::{LedgerDomain, NewTransaction, Transaction};
use crate::metrics::{CounterRegistry, MetricsSink, TRANSACTIONS_CREATED, TRANSACTIONS_LISTED};

/// Shared state behind every route and middleware layer.
#[derive(Clone)]
pub struct LedgerRuntime {
    pub(crate) config: ApiConfig,
    idempotency: Arc<dyn IdempotencyStore>,
    metrics: Arc<CounterRegistry>,
    ledger: Arc<Mutex<LedgerDomain>>,
    features: FeatureFlags,
}

impl LedgerRuntime {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let idempotency = idempotency::from_config(&config)?;
        info!(
            backend = config.idempotency_store.as_str(),
            ttl_secs = config.idempotency_ttl_secs,
            cacheable = config.idempotency_cacheable.as_str(),
            "idempotency store ready"
        );

        Ok(Self::with_components(
            config,
            idempotency,
            Arc::new(CounterRegistry::new()),
        ))
    }

    pub fn with_components(
        config: ApiConfig,
        idempotency: Arc<dyn IdempotencyStore>,
        metrics: Arc<CounterRegistry>,
    ) -> Self {
        let features = FeatureFlags::from_config(&config);

        Self {
            config,
            idempotency,
            metrics,
            ledger: Arc::new(Mutex::new(LedgerDomain::new())),
            features,
        }
    }

    pub fn health_payload(&self) -> Value {
        json!({
            "status": "ok",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        })
    }

    pub fn create_transaction(&self, body: &[u8]) -> Result<Transaction, ApiError> {
        let request = NewTransaction::parse(body)?;
        let transaction = self.ledger_mut()?.record(request);
        self.metrics.increment(TRANSACTIONS_CREATED);
        info!(
            id = %transaction.id,
            kind = %transaction.kind,
            "transaction created"
        );
        Ok(transaction)
    }

    pub fn list_transactions(&self) -> Result<Vec<Transaction>, ApiError> {
        let transactions = self.ledger_mut()?.all();
        self.metrics.increment(TRANSACTIONS_LISTED);
        Ok(transactions)
    }

    pub fn metrics_payload(&self) -> Value {
        json!({ "counters": self.metrics.snapshot() })
    }

    pub fn metrics(&self) -> Arc<CounterRegistry> {
        self.metrics.clone()
    }

    pub fn interceptor(&self) -> IdempotencyInterceptor {
        IdempotencyInterceptor::from_config(
            &self.config,
            self.idempotency.clone(),
            self.metrics.clone(),
        )
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        self.features.clone()
    }

    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(
            self.idempotency.clone(),
            Duration::from_secs(self.config.idempotency_sweep_interval_secs),
        )
    }

    pub(crate) fn ledger_mut(&self) -> Result<MutexGuard<'_, LedgerDomain>, ApiError> {
        self.ledger
            .lock()
            .map_err(|_| ApiError::internal("ledger lock poisoned"))
    }
}
