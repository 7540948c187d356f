//! PostgreSQL test database setup.
//!
//! Tests that need a real database read `TEST_DATABASE_URL` (falling back to
//! `DATABASE_URL`) and are marked `#[ignore]` so the default test run stays
//! self-contained.

use datajpa_domain::{default_registry, SchemaRegistry};
use datajpa_infrastructure::{DatabaseConfig, DatabasePool, PgStore, SessionFactory};
use std::sync::Arc;

/// Test database wrapper with the entity schema installed
pub struct TestDatabase {
    store: Arc<PgStore>,
    registry: SchemaRegistry,
}

impl TestDatabase {
    /// Connect using `TEST_DATABASE_URL` or `DATABASE_URL`.
    pub async fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| anyhow::anyhow!("TEST_DATABASE_URL not set"))?;
        Self::new_with_url(&url).await
    }

    /// Connect, install sequences and tables, and start from empty tables.
    pub async fn new_with_url(connection_string: &str) -> anyhow::Result<Self> {
        let config = DatabaseConfig::test_config(connection_string.to_string());
        let pool = DatabasePool::new(&config).await?;
        let store = Arc::new(PgStore::new(pool));
        let registry = default_registry();

        store.install_schema(&registry).await?;
        store.truncate(&registry).await?;

        Ok(Self { store, registry })
    }

    pub fn store(&self) -> Arc<PgStore> {
        Arc::clone(&self.store)
    }

    /// Session factory over this database.
    pub fn factory(&self) -> SessionFactory {
        SessionFactory::new(self.store())
    }

    /// Clean all tables for test isolation
    pub async fn clean(&self) -> anyhow::Result<()> {
        self.store.truncate(&self.registry).await?;
        Ok(())
    }
}
