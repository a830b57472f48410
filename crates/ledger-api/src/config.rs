use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            "file" | "durable" => Ok(Self::File),
            other => {
                anyhow::bail!("invalid idempotency store '{other}'. expected one of: memory, file")
            }
        }
    }
}

/// Which downstream statuses are safe to replay from the idempotency cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheableStatus {
    /// Exactly `200 OK`.
    OkOnly,
    /// Any `2xx`.
    Success,
}

impl CacheableStatus {
    pub fn allows(self, status: u16) -> bool {
        match self {
            Self::OkOnly => status == 200,
            Self::Success => (200..300).contains(&status),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OkOnly => "ok_only",
            Self::Success => "success",
        }
    }
}

impl FromStr for CacheableStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok_only" | "ok-only" | "ok" | "200" => Ok(Self::OkOnly),
            "success" | "2xx" => Ok(Self::Success),
            other => {
                anyhow::bail!("invalid cacheable status policy '{other}'. expected one of: ok_only, success")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub idempotency_store: StoreBackend,
    pub idempotency_ttl_secs: u64,
    pub idempotency_sweep_interval_secs: u64,
    pub idempotency_claim_timeout_secs: u64,
    pub idempotency_in_flight_wait_ms: u64,
    pub idempotency_cacheable: CacheableStatus,
    /// `"METHOD /path"` pairs the idempotency protocol applies to.
    pub idempotent_endpoints: Vec<String>,
    pub create_transaction_enabled: bool,
    pub get_all_transactions_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let data_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir,
            idempotency_store: StoreBackend::Memory,
            idempotency_ttl_secs: 24 * 60 * 60,
            idempotency_sweep_interval_secs: 60 * 60,
            idempotency_claim_timeout_secs: 30,
            idempotency_in_flight_wait_ms: 5_000,
            idempotency_cacheable: CacheableStatus::OkOnly,
            idempotent_endpoints: vec!["POST /transactions".to_string()],
            create_transaction_enabled: true,
            get_all_transactions_enabled: true,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = env::var("LEDGER_API_HOST") {
            config.host = host;
        }

        if let Ok(port) = env::var("LEDGER_API_PORT") {
            config.port = port
                .parse::<u16>()
                .with_context(|| format!("failed parsing LEDGER_API_PORT='{port}' as u16"))?;
        }

        if let Ok(data_dir) = env::var("LEDGER_API_DATA_DIR")
            && !data_dir.trim().is_empty()
        {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = env::var("LEDGER_API_IDEMPOTENCY_STORE") {
            config.idempotency_store = backend.parse::<StoreBackend>()?;
        }

        config.idempotency_ttl_secs =
            parse_u64_var("LEDGER_API_IDEMPOTENCY_TTL_SECS", config.idempotency_ttl_secs)?;
        config.idempotency_sweep_interval_secs = parse_u64_var(
            "LEDGER_API_IDEMPOTENCY_SWEEP_INTERVAL_SECS",
            config.idempotency_sweep_interval_secs,
        )?;
        config.idempotency_claim_timeout_secs = parse_u64_var(
            "LEDGER_API_IDEMPOTENCY_CLAIM_TIMEOUT_SECS",
            config.idempotency_claim_timeout_secs,
        )?;
        config.idempotency_in_flight_wait_ms = parse_u64_var(
            "LEDGER_API_IDEMPOTENCY_IN_FLIGHT_WAIT_MS",
            config.idempotency_in_flight_wait_ms,
        )?;

        if let Ok(policy) = env::var("LEDGER_API_IDEMPOTENCY_CACHEABLE") {
            config.idempotency_cacheable = policy.parse::<CacheableStatus>()?;
        }

        if let Ok(endpoints) = env::var("LEDGER_API_IDEMPOTENT_ENDPOINTS") {
            config.idempotent_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        config.create_transaction_enabled = parse_bool_var(
            "LEDGER_API_FEATURE_CREATE_TRANSACTION",
            config.create_transaction_enabled,
        )?;
        config.get_all_transactions_enabled = parse_bool_var(
            "LEDGER_API_FEATURE_GET_ALL_TRANSACTIONS",
            config.get_all_transactions_enabled,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idempotency_ttl_secs == 0 {
            anyhow::bail!("LEDGER_API_IDEMPOTENCY_TTL_SECS must be greater than zero");
        }

        if self.idempotency_sweep_interval_secs == 0 {
            anyhow::bail!("LEDGER_API_IDEMPOTENCY_SWEEP_INTERVAL_SECS must be greater than zero");
        }

        if self.idempotency_claim_timeout_secs == 0 {
            anyhow::bail!("LEDGER_API_IDEMPOTENCY_CLAIM_TIMEOUT_SECS must be greater than zero");
        }

        for endpoint in &self.idempotent_endpoints {
            let valid = endpoint
                .split_once(' ')
                .is_some_and(|(method, path)| !method.is_empty() && path.starts_with('/'));
            if !valid {
                anyhow::bail!(
                    "invalid idempotent endpoint '{endpoint}'; expected 'METHOD /path' (e.g. 'POST /transactions')"
                );
            }
        }

        Ok(())
    }
}

fn parse_u64_var(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("failed parsing {name}='{raw}' as u64")),
        Err(_) => Ok(default),
    }
}

fn parse_bool_var(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("failed parsing {name}='{other}' as a boolean"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiConfig, CacheableStatus, StoreBackend};

    #[test]
    fn defaults_keep_entries_for_a_day_and_sweep_hourly() {
        let config = ApiConfig::default();
        assert_eq!(config.idempotency_ttl_secs, 86_400);
        assert_eq!(config.idempotency_sweep_interval_secs, 3_600);
        assert_eq!(config.idempotency_store, StoreBackend::Memory);
        assert_eq!(config.idempotency_cacheable, CacheableStatus::OkOnly);
        assert_eq!(config.idempotent_endpoints, vec!["POST /transactions"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = ApiConfig::default();
        config.idempotency_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_endpoint_entries() {
        let mut config = ApiConfig::default();
        config.idempotent_endpoints = vec!["/transactions".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_store_backends() {
        assert_eq!(
            "memory".parse::<StoreBackend>().ok(),
            Some(StoreBackend::Memory)
        );
        assert_eq!(" FILE ".parse::<StoreBackend>().ok(), Some(StoreBackend::File));
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn cacheable_policies_differ_on_non_ok_success() {
        assert!(CacheableStatus::OkOnly.allows(200));
        assert!(!CacheableStatus::OkOnly.allows(201));
        assert!(CacheableStatus::Success.allows(201));
        assert!(!CacheableStatus::Success.allows(400));
    }
}
