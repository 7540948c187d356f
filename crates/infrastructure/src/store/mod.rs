//! Storage backends.
//!
//! A [`Store`] hands out [`Connection`]s; each connection is one transaction
//! that executes [`CompiledQuery`]s until it is committed or rolled back.

mod locks;
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::query::{CompiledQuery, QueryOutcome};
use crate::Result;
use async_trait::async_trait;
use datajpa_domain::EntitySchema;
use std::fmt::Debug;
use std::time::Duration;

/// A source of transactional connections.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Start a transaction. Lock waits default to `lock_timeout`.
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn Connection>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// One open transaction.
///
/// After `commit` or `rollback` the connection must not be used again.
#[async_trait]
pub trait Connection: Send {
    /// Next identity from the schema's sequence. Not undone by rollback.
    async fn next_id(&mut self, schema: &'static EntitySchema) -> Result<i64>;

    /// Run one statement.
    async fn execute(&mut self, query: &CompiledQuery) -> Result<QueryOutcome>;

    /// Make every write durable and release all locks.
    async fn commit(&mut self) -> Result<()>;

    /// Undo every write of the transaction and release all locks.
    async fn rollback(&mut self) -> Result<()>;
}
