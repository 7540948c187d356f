//! Common utilities shared by the repository layer.
//!
//! This crate provides:
//! - Pagination request and result types (`PageRequest`, `Sort`, `Page`, `Slice`)
//! - Configuration management
//! - Structured logging setup
//! - The clock used for audit timestamps
//! - Caller-side retry with backoff

pub mod config;
pub mod datetime;
pub mod pagination;
pub mod retry;
pub mod telemetry;

// Re-export commonly used types
pub use config::{AppConfig, DatabaseSettings, SessionConfig, TelemetryConfig};
pub use datetime::{now_utc, Clock, SystemClock};
pub use pagination::{Order, Page, PageRequest, Slice, Sort, SortDirection, DEFAULT_PAGE_SIZE};
pub use retry::{retry_with_predicate, RetryConfig};
pub use telemetry::init_tracing;

/// Common error type used by configuration and telemetry setup
pub type Result<T> = std::result::Result<T, anyhow::Error>;
