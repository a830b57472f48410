//! HTTP transaction ledger with idempotent request handling.
//!
//! `POST /transactions` honours an optional `Idempotency-Key` header: a retry
//! carrying the same key and body replays the first response instead of
//! recording a second transaction.

pub mod config;
pub mod errors;
pub mod feature_flags;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod runtime;
pub mod transport;

pub use config::{ApiConfig, CacheableStatus, StoreBackend};
pub use errors::{ApiError, ErrorCode};
pub use idempotency::{IDEMPOTENCY_KEY_HEADER, IdempotencyInterceptor, IdempotencyStore};
pub use ledger::{Transaction, TransactionType};
pub use metrics::CounterRegistry;
pub use runtime::LedgerRuntime;
pub use transport::{router, serve, serve_with_listener};
