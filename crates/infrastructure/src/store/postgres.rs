//! PostgreSQL store.
//!
//! Every connection is one sqlx transaction; compiled statements are sent
//! as-is with typed binds. Lock waits are bounded with `SET LOCAL
//! lock_timeout`.

use super::{Connection, Store};
use crate::database::DatabasePool;
use crate::query::plan::{BindParam, Plan};
use crate::query::{CompiledQuery, QueryOutcome, ResultLayout};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datajpa_domain::{EntitySchema, FieldKind, FieldType, SchemaRegistry, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// DDL creating sequences and tables, referenced tables first.
    pub fn schema_ddl(registry: &SchemaRegistry) -> Vec<String> {
        let mut ordered: Vec<&'static EntitySchema> = Vec::new();
        for schema in registry.schemas() {
            push_with_targets(schema, &mut ordered);
        }

        let mut statements = Vec::new();
        for schema in ordered {
            statements.push(format!(
                "CREATE SEQUENCE IF NOT EXISTS {} START WITH 1 INCREMENT BY 1",
                schema.sequence_name()
            ));

            let columns: Vec<String> = schema
                .fields
                .iter()
                .map(|field| {
                    let mut column = format!("{} {}", field.column, field.ty.sql_type());
                    match field.kind {
                        FieldKind::Id => column.push_str(" PRIMARY KEY"),
                        FieldKind::Version => column.push_str(" NOT NULL DEFAULT 0"),
                        _ if !field.nullable => column.push_str(" NOT NULL"),
                        _ => {}
                    }
                    if let Some(association) =
                        schema.associations.iter().find(|a| a.foreign_key == field.name)
                    {
                        let target = association.target_schema();
                        column.push_str(&format!(
                            " REFERENCES {} ({})",
                            target.table,
                            target.id_field().column
                        ));
                    }
                    column
                })
                .collect();

            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                schema.table,
                columns.join(", ")
            ));
        }
        statements
    }

    /// Create sequences and tables for every registered entity.
    #[instrument(skip(self, registry))]
    pub async fn install_schema(&self, registry: &SchemaRegistry) -> Result<()> {
        for statement in Self::schema_ddl(registry) {
            debug!(sql = %statement, "Installing schema");
            sqlx::query(&statement).execute(self.pool.pool()).await?;
        }
        info!(entities = registry.schemas().len(), "Schema installed");
        Ok(())
    }

    /// Delete every row of the registered tables, referencing tables first.
    #[instrument(skip(self, registry))]
    pub async fn truncate(&self, registry: &SchemaRegistry) -> Result<()> {
        let tables: Vec<&str> = registry.schemas().iter().map(|s| s.table).collect();
        let statement = format!("TRUNCATE {} RESTART IDENTITY CASCADE", tables.join(", "));
        sqlx::query(&statement).execute(self.pool.pool()).await?;
        Ok(())
    }
}

fn push_with_targets(schema: &'static EntitySchema, ordered: &mut Vec<&'static EntitySchema>) {
    if ordered.contains(&schema) {
        return;
    }
    for association in schema.associations {
        let target = association.target_schema();
        if target != schema {
            push_with_targets(target, ordered);
        }
    }
    if !ordered.contains(&schema) {
        ordered.push(schema);
    }
}

/// `lock_timeout` setting; PostgreSQL treats 0 as "wait forever".
fn lock_timeout_setting(timeout: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1))
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, lock_timeout: Duration) -> Result<Box<dyn Connection>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&lock_timeout_setting(lock_timeout))
            .execute(&mut *tx)
            .await
            .map_err(map_error)?;

        Ok(Box::new(PgConnection {
            tx: Some(tx),
            lock_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Map PostgreSQL failures onto the error taxonomy by SQLSTATE.
fn map_error(error: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &error {
        match db.code().as_deref() {
            Some("55P03") => return Error::LockTimeout(db.message().to_string()),
            Some("40P01") | Some("40001") => return Error::LockConflict(db.message().to_string()),
            Some(code) if code.starts_with("23") => {
                return Error::Constraint(db.message().to_string())
            }
            _ => {}
        }
    }
    Error::Database(error)
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q BindParam,
) -> Query<'q, Postgres, PgArguments> {
    match (&param.value, param.ty) {
        (Value::Null, FieldType::Int) => query.bind(None::<i64>),
        (Value::Null, FieldType::Text) => query.bind(None::<String>),
        (Value::Null, FieldType::Bool) => query.bind(None::<bool>),
        (Value::Null, FieldType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        (Value::Int(v), _) => query.bind(*v),
        (Value::Text(v), _) => query.bind(v.as_str()),
        (Value::Bool(v), _) => query.bind(*v),
        (Value::Timestamp(v), _) => query.bind(*v),
        // NULL list items can never match, so they are dropped
        (Value::List(items), FieldType::Int) => {
            query.bind(items.iter().filter_map(Value::as_int).collect::<Vec<i64>>())
        }
        (Value::List(items), FieldType::Text) => query.bind(
            items
                .iter()
                .filter_map(|v| v.as_text().map(str::to_string))
                .collect::<Vec<String>>(),
        ),
        (Value::List(items), FieldType::Bool) => {
            query.bind(items.iter().filter_map(Value::as_bool).collect::<Vec<bool>>())
        }
        (Value::List(items), FieldType::Timestamp) => query.bind(
            items
                .iter()
                .filter_map(Value::as_timestamp)
                .collect::<Vec<DateTime<Utc>>>(),
        ),
    }
}

fn decode(row: &PgRow, index: usize, ty: FieldType) -> Result<Value> {
    let value = match ty {
        FieldType::Int => row.try_get::<Option<i64>, _>(index)?.into(),
        FieldType::Text => row.try_get::<Option<String>, _>(index)?.into(),
        FieldType::Bool => row.try_get::<Option<bool>, _>(index)?.into(),
        FieldType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(index)?.into(),
    };
    Ok(value)
}

struct PgConnection {
    tx: Option<Transaction<'static, Postgres>>,
    lock_timeout: Duration,
}

impl PgConnection {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or_else(|| {
            Error::TransactionInactive("postgres transaction already ended".to_string())
        })
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn next_id(&mut self, schema: &'static EntitySchema) -> Result<i64> {
        let sql = format!("SELECT nextval('{}')", schema.sequence_name());
        let tx = self.tx()?;
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_error)
    }

    #[instrument(skip(self, query), fields(kind = ?query.kind()))]
    async fn execute(&mut self, query: &CompiledQuery) -> Result<QueryOutcome> {
        let default_timeout = self.lock_timeout;
        let (override_timeout, nowait) = match &query.plan {
            Plan::Select(plan) if plan.lock.is_locking() => match plan.lock_timeout {
                Some(timeout) if timeout.is_zero() => (None, true),
                Some(timeout) if timeout != default_timeout => (Some(timeout), false),
                _ => (None, false),
            },
            _ => (None, false),
        };

        let sql = if nowait {
            format!("{} NOWAIT", query.sql)
        } else {
            query.sql.clone()
        };

        let tx = self.tx()?;
        if let Some(timeout) = override_timeout {
            sqlx::query(&lock_timeout_setting(timeout))
                .execute(&mut **tx)
                .await
                .map_err(map_error)?;
        }

        let mut statement = sqlx::query(&sql);
        for param in &query.params {
            statement = bind(statement, param);
        }

        let outcome = match &query.layout {
            ResultLayout::Affected => statement
                .execute(&mut **tx)
                .await
                .map(|done| QueryOutcome::Affected(done.rows_affected())),
            layout => {
                let types = layout.column_types();
                match statement.fetch_all(&mut **tx).await {
                    Ok(rows) => {
                        let mut decoded = Vec::with_capacity(rows.len());
                        for row in &rows {
                            let values = types
                                .iter()
                                .enumerate()
                                .map(|(i, ty)| decode(row, i, *ty))
                                .collect::<Result<Vec<_>>>()?;
                            decoded.push(values);
                        }
                        Ok(QueryOutcome::Rows(decoded))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let outcome = outcome.map_err(|e| match map_error(e) {
            Error::LockTimeout(message) if nowait => Error::LockConflict(message),
            other => other,
        })?;

        if override_timeout.is_some() {
            sqlx::query(&lock_timeout_setting(default_timeout))
                .execute(&mut **tx)
                .await
                .map_err(map_error)?;
        }

        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            Error::TransactionInactive("postgres transaction already ended".to_string())
        })?;
        tx.commit().await.map_err(map_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            Error::TransactionInactive("postgres transaction already ended".to_string())
        })?;
        tx.rollback().await.map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datajpa_domain::default_registry;

    #[test]
    fn test_schema_ddl_orders_referenced_tables_first() {
        let registry = SchemaRegistry::new().with(&datajpa_domain::MEMBER_SCHEMA);
        let ddl = PgStore::schema_ddl(&registry);

        let team = ddl.iter().position(|s| s.starts_with("CREATE TABLE IF NOT EXISTS team ")).unwrap();
        let member = ddl
            .iter()
            .position(|s| s.starts_with("CREATE TABLE IF NOT EXISTS member "))
            .unwrap();
        assert!(team < member);
        assert!(ddl[member].contains("team_id BIGINT REFERENCES team (team_id)"));
        assert!(ddl[member].contains("member_id BIGINT PRIMARY KEY"));
        assert!(ddl[member].contains("version BIGINT NOT NULL DEFAULT 0"));
        assert!(ddl.contains(&"CREATE SEQUENCE IF NOT EXISTS member_seq START WITH 1 INCREMENT BY 1".to_string()));
    }

    #[test]
    fn test_default_registry_ddl_has_no_duplicates() {
        let ddl = PgStore::schema_ddl(&default_registry());
        assert_eq!(ddl.len(), 4);
    }

    #[test]
    fn test_lock_timeout_setting_never_zero() {
        assert_eq!(
            lock_timeout_setting(Duration::ZERO),
            "SET LOCAL lock_timeout = '1ms'"
        );
        assert_eq!(
            lock_timeout_setting(Duration::from_secs(3)),
            "SET LOCAL lock_timeout = '3000ms'"
        );
    }
}
