//! Identity map, staged writes and the transaction they are flushed into.

use super::mapper::{ResultRow, RowMapper};
use super::statistics::SessionStatistics;
use crate::query::{Arguments, CompiledQuery, QueryCompiler, QueryModel, QueryOutcome, ResultLayout, RowWrite};
use crate::store::{Connection, Store};
use crate::{Error, Result};
use datajpa_common::{Clock, SessionConfig};
use datajpa_domain::{AuditFields, Entity, EntityId, EntitySchema, FieldKind, Row, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entity name and raw identity.
type EntityKey = (&'static str, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Managed,
    Removed,
}

#[derive(Debug, Clone)]
struct Entry {
    schema: &'static EntitySchema,
    /// Session state of the entity; version excluded
    row: Row,
    /// Version as last read from or written to the store
    version: Option<i64>,
    read_only: bool,
    state: EntryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Update,
    Delete,
}

/// A pending write. The row is taken from the identity map at flush time.
#[derive(Debug, Clone, Copy)]
struct StagedWrite {
    op: WriteOp,
    key: EntityKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    RollbackOnly,
}

pub(crate) struct UnitOfWork {
    id: Uuid,
    store: Arc<dyn Store>,
    compiler: Arc<QueryCompiler>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    connection: Option<Box<dyn Connection>>,
    entries: HashMap<EntityKey, Entry>,
    staged: Vec<StagedWrite>,
    statistics: SessionStatistics,
    status: Status,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("store", &self.store.name())
            .field("in_transaction", &self.connection.is_some())
            .field("managed", &self.entries.len())
            .field("staged", &self.staged.len())
            .field("status", &self.status)
            .finish()
    }
}

impl UnitOfWork {
    pub(crate) fn new(
        id: Uuid,
        store: Arc<dyn Store>,
        compiler: Arc<QueryCompiler>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            store,
            compiler,
            config,
            clock,
            connection: None,
            entries: HashMap::new(),
            staged: Vec::new(),
            statistics: SessionStatistics::default(),
            status: Status::Active,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn compiler(&self) -> &QueryCompiler {
        &self.compiler
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn statistics(&self) -> &SessionStatistics {
        &self.statistics
    }

    pub(crate) fn statistics_mut(&mut self) -> &mut SessionStatistics {
        &mut self.statistics
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.status == Status::RollbackOnly
    }

    pub(crate) fn has_staged_writes(&self) -> bool {
        !self.staged.is_empty()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            Status::Active => Ok(()),
            Status::RollbackOnly => Err(Error::TransactionInactive(
                "a statement failed; the session can only be rolled back".to_string(),
            )),
        }
    }

    fn poison(&mut self, error: &Error) {
        if self.status == Status::Active {
            warn!(session = %self.id, error = %error, "Marking session rollback-only");
        }
        self.status = Status::RollbackOnly;
    }

    /// The open connection, beginning a transaction on first use.
    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            debug!(session = %self.id, store = self.store.name(), "Beginning transaction");
            let connection = self.store.begin(self.config.lock_timeout()).await?;
            self.connection = Some(connection);
        }
        self.connection
            .as_mut()
            .ok_or_else(|| Error::TransactionInactive("no open connection".to_string()))
    }

    /// Send one statement. Store failures poison the session.
    async fn run(&mut self, query: &CompiledQuery) -> Result<QueryOutcome> {
        if self.config.log_statements {
            debug!(
                session = %self.id,
                kind = ?query.kind(),
                sql = %query.sql,
                params = query.params.len(),
                "Executing statement"
            );
        }
        self.statistics.record(query);

        let outcome = match self.connection().await {
            Ok(connection) => connection.execute(query).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            self.poison(e);
        }
        outcome
    }

    async fn next_id(&mut self, schema: &'static EntitySchema) -> Result<i64> {
        let id = match self.connection().await {
            Ok(connection) => connection.next_id(schema).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &id {
            self.poison(e);
        }
        id
    }

    fn stage(&mut self, op: WriteOp, key: EntityKey) {
        match op {
            WriteOp::Insert => self.staged.push(StagedWrite { op, key }),
            WriteOp::Update => {
                // a pending insert or update already carries the latest row
                if !self.staged.iter().any(|w| w.key == key) {
                    self.staged.push(StagedWrite { op, key });
                }
            }
            WriteOp::Delete => {
                let pending_insert = self
                    .staged
                    .iter()
                    .any(|w| w.key == key && w.op == WriteOp::Insert);
                self.staged.retain(|w| w.key != key);
                if !pending_insert {
                    self.staged.push(StagedWrite { op, key });
                }
            }
        }
    }

    /// Load a row into the identity map unless it is already there.
    async fn load_if_absent(&mut self, schema: &'static EntitySchema, id: i64) -> Result<()> {
        if self.entries.contains_key(&(schema.name, id)) {
            return Ok(());
        }
        let query = self.compiler.find_by_id(schema, id)?;
        self.select(&query, false).await?;
        Ok(())
    }

    pub(crate) async fn persist<E: Entity>(&mut self, mut entity: E) -> Result<E> {
        self.ensure_active()?;
        let schema = E::schema();
        if let Some(id) = entity.id() {
            return Err(Error::Constraint(format!(
                "{} {} is already persistent",
                schema.name, id
            )));
        }
        entity.validate()?;

        entity.pre_persist(self.clock.now());
        let id = self.next_id(schema).await?;
        entity.assign_id(E::Id::from_raw(id));

        let key = (schema.name, id);
        self.entries.insert(
            key,
            Entry {
                schema,
                row: entity.to_row(),
                version: schema.version_field().map(|_| 0),
                read_only: false,
                state: EntryState::Managed,
            },
        );
        self.stage(WriteOp::Insert, key);

        debug!(session = %self.id, entity = schema.name, id, "Staged insert");
        Ok(entity)
    }

    pub(crate) async fn merge<E: Entity>(&mut self, mut entity: E) -> Result<E> {
        self.ensure_active()?;
        let schema = E::schema();
        let id = entity.raw_id().ok_or_else(|| {
            Error::NotFound(format!("{} without identity cannot be merged", schema.name))
        })?;
        entity.validate()?;

        self.load_if_absent(schema, id).await?;
        let now = self.clock.now();
        let key = (schema.name, id);

        let entry = match self.entries.get_mut(&key) {
            Some(entry) if entry.state == EntryState::Managed => entry,
            _ => return Err(Error::NotFound(format!("{} {}", schema.name, id))),
        };

        if entry.read_only {
            warn!(
                session = %self.id,
                entity = schema.name,
                id,
                "Update of read-only entity ignored"
            );
            return Ok(E::from_row(&entry.row)?);
        }

        let created_date = AuditFields::read_from(&entry.row)?.created_date;
        entity.pre_update(now);
        entity.audit_mut().created_date = created_date;
        entry.row = entity.to_row();

        self.stage(WriteOp::Update, key);
        debug!(session = %self.id, entity = schema.name, id, "Staged update");
        Ok(entity)
    }

    pub(crate) async fn find<E: Entity>(&mut self, id: E::Id) -> Result<Option<E>> {
        self.ensure_active()?;
        let schema = E::schema();
        let raw = id.raw();
        self.load_if_absent(schema, raw).await?;

        match self.entries.get(&(schema.name, raw)) {
            Some(entry) if entry.state == EntryState::Managed => Ok(Some(E::from_row(&entry.row)?)),
            _ => Ok(None),
        }
    }

    /// Stage removal of a row.
    ///
    /// Fails with `NotFound` when the row is missing or already removed in
    /// this session.
    pub(crate) async fn remove(&mut self, schema: &'static EntitySchema, id: i64) -> Result<()> {
        self.ensure_active()?;
        self.load_if_absent(schema, id).await?;
        let key = (schema.name, id);

        match self.entries.get_mut(&key) {
            Some(entry) if entry.state == EntryState::Managed => entry.state = EntryState::Removed,
            _ => return Err(Error::NotFound(format!("{} {}", schema.name, id))),
        }
        self.stage(WriteOp::Delete, key);

        debug!(session = %self.id, entity = schema.name, id, "Staged delete");
        Ok(())
    }

    pub(crate) fn contains(&self, schema: &EntitySchema, id: i64) -> bool {
        self.entries
            .get(&(schema.name, id))
            .is_some_and(|e| e.state == EntryState::Managed)
    }

    pub(crate) fn managed_count(&self, schema: &EntitySchema) -> usize {
        self.entries
            .iter()
            .filter(|(key, e)| key.0 == schema.name && e.state == EntryState::Managed)
            .count()
    }

    /// Write every staged change, in staging order.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.staged.is_empty() {
            return Ok(());
        }

        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        for write in staged {
            if let Err(e) = self.flush_one(write).await {
                self.poison(&e);
                return Err(e);
            }
        }

        self.statistics.record_flush();
        debug!(session = %self.id, writes = count, "Flushed staged writes");
        Ok(())
    }

    async fn flush_one(&mut self, write: StagedWrite) -> Result<()> {
        let (schema, id) = (write.key.0, write.key.1);
        let entry = self
            .entries
            .get(&write.key)
            .ok_or_else(|| Error::NotFound(format!("{} {}", schema, id)))?;
        let schema = entry.schema;

        let values = match write.op {
            WriteOp::Delete => Vec::new(),
            WriteOp::Insert | WriteOp::Update => schema
                .fields
                .iter()
                .filter(|f| f.kind != FieldKind::Version)
                .map(|f| (f, entry.row.get(f.name).cloned().unwrap_or(Value::Null)))
                .collect(),
        };
        let expected_version = match write.op {
            WriteOp::Update | WriteOp::Delete if schema.optimistic_locking => entry.version,
            _ => None,
        };
        let row_write = RowWrite {
            schema,
            id,
            values,
            expected_version,
        };

        let query = match write.op {
            WriteOp::Insert => self.compiler.insert(row_write),
            WriteOp::Update => self.compiler.update(row_write),
            WriteOp::Delete => self.compiler.delete(row_write),
        };

        let affected = match self.run(&query).await? {
            QueryOutcome::Affected(n) => n,
            QueryOutcome::Rows(rows) => rows.len() as u64,
        };
        if affected == 0 {
            return Err(match write.op {
                WriteOp::Delete => {
                    Error::NotFound(format!("{} {} was already removed", schema.name, id))
                }
                WriteOp::Insert | WriteOp::Update => Error::StaleData {
                    entity: schema.name,
                    id,
                },
            });
        }

        if write.op == WriteOp::Update {
            if let Some(entry) = self.entries.get_mut(&write.key) {
                entry.version = entry.version.map(|v| v + 1);
            }
        }
        Ok(())
    }

    /// Run a select and pass entity rows through the identity map.
    async fn select(&mut self, query: &CompiledQuery, read_only: bool) -> Result<Vec<ResultRow>> {
        let rows = match self.run(query).await? {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::Affected(_) => {
                return Err(Error::InvalidQuery(format!(
                    "statement returned no rows: {}",
                    query.sql
                )))
            }
        };

        let resolved: Vec<ResultRow> = match &query.layout {
            ResultLayout::Entities(schemas) => rows
                .into_iter()
                .map(|values| self.resolve_entities(schemas, values, read_only))
                .collect(),
            _ => rows.into_iter().map(ResultRow::Values).collect(),
        };
        Ok(resolved)
    }

    fn resolve_entities(
        &mut self,
        schemas: &[&'static EntitySchema],
        values: Vec<Value>,
        read_only: bool,
    ) -> ResultRow {
        let mut values = values.into_iter();
        let mut resolved = Vec::with_capacity(schemas.len());

        for schema in schemas {
            let mut row = Row::new();
            let mut version = None;
            for field in schema.fields {
                let value = values.next().unwrap_or(Value::Null);
                if field.kind == FieldKind::Version {
                    version = value.as_int();
                } else {
                    row.set(field.name, value);
                }
            }

            match row.get(schema.id_field().name).and_then(Value::as_int) {
                Some(id) => resolved.push(Some(self.register(schema, id, row, version, read_only))),
                None => resolved.push(None),
            }
        }
        ResultRow::Entities(resolved)
    }

    /// Identity map lookup: a managed entity keeps its session state.
    fn register(
        &mut self,
        schema: &'static EntitySchema,
        id: i64,
        row: Row,
        version: Option<i64>,
        read_only: bool,
    ) -> Row {
        let key = (schema.name, id);
        if let Some(entry) = self.entries.get(&key) {
            return entry.row.clone();
        }

        self.statistics.record_loaded(1);
        self.entries.insert(
            key,
            Entry {
                schema,
                row: row.clone(),
                version,
                read_only,
                state: EntryState::Managed,
            },
        );
        row
    }

    /// Flush, then run a select.
    pub(crate) async fn rows(&mut self, query: &CompiledQuery, read_only: bool) -> Result<Vec<ResultRow>> {
        self.flush().await?;
        self.select(query, read_only).await
    }

    /// Flush, run a select and map each row.
    pub(crate) async fn list_compiled<T>(
        &mut self,
        query: &CompiledQuery,
        mapper: &RowMapper<T>,
        read_only: bool,
    ) -> Result<Vec<T>> {
        let rows = self.rows(query, read_only).await?;
        rows.into_iter()
            .map(|row| mapper.map(row).map_err(Error::from))
            .collect()
    }

    pub(crate) async fn list<T>(
        &mut self,
        model: &QueryModel,
        args: &Arguments,
        mapper: &RowMapper<T>,
        read_only: bool,
    ) -> Result<Vec<T>> {
        let query = self.compiler.compile(model, args)?;
        self.list_compiled(&query, mapper, read_only).await
    }

    /// Flush, then run a count statement.
    pub(crate) async fn count(&mut self, query: &CompiledQuery) -> Result<u64> {
        self.flush().await?;
        match self.run(query).await? {
            QueryOutcome::Rows(rows) => rows
                .first()
                .and_then(|row| row.first())
                .and_then(Value::as_int)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| Error::InvalidQuery(format!("count returned no value: {}", query.sql))),
            QueryOutcome::Affected(_) => Err(Error::InvalidQuery(format!(
                "statement is not a count: {}",
                query.sql
            ))),
        }
    }

    /// Flush, then run a bulk update or delete.
    pub(crate) async fn bulk(&mut self, query: &CompiledQuery) -> Result<u64> {
        self.flush().await?;
        match self.run(query).await? {
            QueryOutcome::Affected(n) => Ok(n),
            QueryOutcome::Rows(_) => Err(Error::InvalidQuery(format!(
                "statement is not a bulk write: {}",
                query.sql
            ))),
        }
    }

    /// Detach everything. Staged writes are discarded.
    pub(crate) fn clear(&mut self) {
        if !self.staged.is_empty() {
            warn!(session = %self.id, discarded = self.staged.len(), "Clearing session with staged writes");
        }
        self.staged.clear();
        self.entries.clear();
    }

    /// Detach every entity of one type. Their staged writes are discarded.
    pub(crate) fn evict_all(&mut self, schema: &EntitySchema) -> usize {
        let staged = self.staged.len();
        self.staged.retain(|w| w.key.0 != schema.name);
        if self.staged.len() != staged {
            warn!(
                session = %self.id,
                entity = schema.name,
                discarded = staged - self.staged.len(),
                "Evicting entities with staged writes"
            );
        }

        let before = self.entries.len();
        self.entries.retain(|key, _| key.0 != schema.name);
        before - self.entries.len()
    }

    /// Flush and commit. The identity map survives; the next statement
    /// begins a new transaction.
    pub(crate) async fn commit(&mut self) -> Result<()> {
        self.flush().await?;
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.commit().await {
                self.entries.clear();
                return Err(e);
            }
        }
        info!(session = %self.id, managed = self.entries.len(), "Transaction committed");
        Ok(())
    }

    /// Undo every write of the transaction and detach everything.
    pub(crate) async fn rollback(&mut self) -> Result<()> {
        let discarded = self.staged.len();
        self.staged.clear();
        self.entries.clear();
        self.status = Status::Active;

        if let Some(mut connection) = self.connection.take() {
            connection.rollback().await?;
        }
        info!(session = %self.id, discarded, "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use datajpa_common::SystemClock;
    use datajpa_domain::{default_registry, Member, MemberId};

    fn unit_of_work(store: &Arc<MemoryStore>) -> UnitOfWork {
        UnitOfWork::new(
            Uuid::new_v4(),
            store.clone(),
            Arc::new(QueryCompiler::new(default_registry())),
            SessionConfig::default(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_staged_writes_coalesce() {
        let store = MemoryStore::shared();
        let mut uow = unit_of_work(&store);

        let mut member = uow.persist(Member::with_age("member1", 10)).await.unwrap();
        member.age = 11;
        let member = uow.merge(member).await.unwrap();
        assert_eq!(uow.staged.len(), 1);
        assert_eq!(uow.staged[0].op, WriteOp::Insert);

        uow.flush().await.unwrap();
        assert_eq!(store.row_count(Member::schema()), 1);
        assert_eq!(uow.statistics().statement_count(), 1);

        uow.remove(Member::schema(), member.raw_id().unwrap()).await.unwrap();
        assert!(!uow.contains(Member::schema(), member.raw_id().unwrap()));
        uow.flush().await.unwrap();
        assert_eq!(store.row_count(Member::schema()), 0);
    }

    #[tokio::test]
    async fn test_delete_of_staged_insert_writes_nothing() {
        let store = MemoryStore::shared();
        let mut uow = unit_of_work(&store);

        let member = uow.persist(Member::new("member1")).await.unwrap();
        uow.remove(Member::schema(), member.raw_id().unwrap()).await.unwrap();
        assert!(!uow.has_staged_writes());

        uow.flush().await.unwrap();
        assert_eq!(uow.statistics().statement_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_map_serves_repeat_finds() {
        let store = MemoryStore::shared();
        let mut uow = unit_of_work(&store);
        let member = uow.persist(Member::new("member1")).await.unwrap();
        uow.commit().await.unwrap();

        let id = member.id.unwrap();
        let first = uow.find::<Member>(id).await.unwrap();
        assert_eq!(first, Some(member));
        assert_eq!(uow.statistics().query_count(), 0);

        uow.clear();
        uow.find::<Member>(id).await.unwrap();
        uow.find::<Member>(id).await.unwrap();
        assert_eq!(uow.statistics().query_count(), 1);

        assert!(uow.find::<Member>(MemberId::new(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_flush_poisons_session() {
        let store = MemoryStore::shared();
        let mut uow = unit_of_work(&store);

        let member = uow.persist(Member::new("member1")).await.unwrap();
        uow.commit().await.unwrap();

        // another transaction removes the row behind our back
        let mut other = unit_of_work(&store);
        other.remove(Member::schema(), member.raw_id().unwrap()).await.unwrap();
        other.commit().await.unwrap();

        uow.remove(Member::schema(), member.raw_id().unwrap()).await.unwrap();
        let err = uow.flush().await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(uow.is_rollback_only());

        let err = uow.find::<Member>(member.id.unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::TransactionInactive(_)));

        uow.rollback().await.unwrap();
        assert!(!uow.is_rollback_only());
    }
}
