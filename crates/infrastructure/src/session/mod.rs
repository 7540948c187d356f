//! Sessions: one unit of work over one store transaction.
//!
//! A [`Session`] is a cheap handle; clones share the same identity map,
//! staged writes and connection, so several repositories can work in one
//! transaction. Operations on a session are serialized.
//!
//! Writes are never sent when they are made. `save` and `delete` stage them,
//! and they reach the store on [`Session::flush`], on [`Session::commit`], or
//! automatically before any query or bulk statement.

mod mapper;
mod statistics;
pub(crate) mod unit_of_work;

pub use mapper::{ResultRow, RowMapper};
pub use statistics::{SessionStatistics, StatementRecord};

use crate::database::{DatabaseConfig, DatabasePool};
use crate::mutation::{self, BulkKind, InvalidationPolicy};
use crate::paging;
use crate::query::{self, Arguments, QueryCompiler, QueryDescriptor, ResultShape, Subject};
use crate::store::{PgStore, Store};
use crate::{Error, Result};
use datajpa_common::{AppConfig, Clock, Page, PageRequest, SessionConfig, Slice, SystemClock};
use datajpa_domain::{default_registry, Entity, EntityId, EntitySchema, SchemaRegistry, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;
use unit_of_work::UnitOfWork;
use uuid::Uuid;

/// Opens sessions against one store.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    store: Arc<dyn Store>,
    compiler: Arc<QueryCompiler>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionFactory {
    /// Factory over `store` with the default registry, config and clock.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            compiler: Arc::new(QueryCompiler::new(default_registry())),
            config: SessionConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Connect to PostgreSQL with the loaded application settings.
    #[instrument(skip(config), fields(pool_size = config.database.pool_size))]
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let pool = DatabasePool::new(&DatabaseConfig::from(&config.database)).await?;
        Ok(Self::new(Arc::new(PgStore::new(pool))).with_config(config.session.clone()))
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for lifecycle timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Entities resolvable from explicit query text.
    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.compiler = Arc::new(QueryCompiler::new(registry));
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session. The transaction begins with its first statement.
    pub fn open(&self) -> Session {
        let id = Uuid::now_v7();
        let uow = UnitOfWork::new(
            id,
            self.store.clone(),
            self.compiler.clone(),
            self.config.clone(),
            self.clock.clone(),
        );
        Session {
            id,
            inner: Arc::new(Mutex::new(uow)),
        }
    }
}

/// Result of [`Session::execute`], tagged by what the query produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult<T> {
    Count(u64),
    Exists(bool),
    /// Rows written by a bulk statement or removed by a derived delete
    Affected(u64),
    One(T),
    List(Vec<T>),
    Optional(Option<T>),
    Page(Page<T>),
    Slice(Slice<T>),
}

impl<T> QueryResult<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Exists(_) => "exists",
            Self::Affected(_) => "affected",
            Self::One(_) => "single",
            Self::List(_) => "list",
            Self::Optional(_) => "optional",
            Self::Page(_) => "page",
            Self::Slice(_) => "slice",
        }
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::InvalidQuery(format!(
            "expected a {} result, query produced {}",
            expected,
            self.name()
        ))
    }

    pub fn into_list(self) -> Result<Vec<T>> {
        match self {
            Self::List(items) => Ok(items),
            Self::Optional(item) => Ok(item.into_iter().collect()),
            Self::One(item) => Ok(vec![item]),
            other => Err(other.mismatch("list")),
        }
    }

    pub fn into_optional(self) -> Result<Option<T>> {
        match self {
            Self::Optional(item) => Ok(item),
            Self::One(item) => Ok(Some(item)),
            other => Err(other.mismatch("optional")),
        }
    }

    /// The single result; `NotFound` when there is none.
    pub fn into_one(self) -> Result<T> {
        match self {
            Self::One(item) | Self::Optional(Some(item)) => Ok(item),
            Self::Optional(None) => Err(Error::NotFound("query returned no result".to_string())),
            other => Err(other.mismatch("single")),
        }
    }

    pub fn into_page(self) -> Result<Page<T>> {
        match self {
            Self::Page(page) => Ok(page),
            other => Err(other.mismatch("page")),
        }
    }

    pub fn into_slice(self) -> Result<Slice<T>> {
        match self {
            Self::Slice(slice) => Ok(slice),
            other => Err(other.mismatch("slice")),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        match self {
            Self::Count(n) | Self::Affected(n) => Ok(n),
            other => Err(other.mismatch("count")),
        }
    }

    pub fn into_exists(self) -> Result<bool> {
        match self {
            Self::Exists(found) => Ok(found),
            Self::Count(n) => Ok(n > 0),
            other => Err(other.mismatch("exists")),
        }
    }
}

/// Handle to a unit of work.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    inner: Arc<Mutex<UnitOfWork>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stage the insert of a new entity.
    ///
    /// Runs `pre_persist` and draws the identity from the entity's sequence.
    #[instrument(skip(self, entity), fields(session = %self.id, entity = E::schema().name))]
    pub async fn persist<E: Entity>(&self, entity: E) -> Result<E> {
        self.inner.lock().await.persist(entity).await
    }

    /// Stage the update of an entity that has an identity.
    ///
    /// An entity not yet managed is loaded first; a missing row is
    /// `NotFound`. Updates of entities loaded read-only are logged and
    /// dropped, and the managed state is returned.
    #[instrument(skip(self, entity), fields(session = %self.id, entity = E::schema().name))]
    pub async fn merge<E: Entity>(&self, entity: E) -> Result<E> {
        self.inner.lock().await.merge(entity).await
    }

    /// `persist` without identity, `merge` with.
    pub async fn save<E: Entity>(&self, entity: E) -> Result<E> {
        match entity.id() {
            None => self.persist(entity).await,
            Some(_) => self.merge(entity).await,
        }
    }

    #[instrument(skip(self), fields(session = %self.id, entity = E::schema().name))]
    pub async fn find<E: Entity>(&self, id: E::Id) -> Result<Option<E>> {
        self.inner.lock().await.find::<E>(id).await
    }

    /// Like [`Session::find`], but a missing entity is `NotFound`.
    pub async fn get<E: Entity>(&self, id: E::Id) -> Result<E> {
        self.find::<E>(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}", E::schema().name, id)))
    }

    /// Stage removal of an entity.
    pub async fn remove<E: Entity>(&self, entity: &E) -> Result<()> {
        let id = entity.id().ok_or_else(|| {
            Error::NotFound(format!("{} without identity cannot be removed", E::schema().name))
        })?;
        self.remove_by_id::<E>(id).await
    }

    #[instrument(skip(self), fields(session = %self.id, entity = E::schema().name))]
    pub async fn remove_by_id<E: Entity>(&self, id: E::Id) -> Result<()> {
        self.inner.lock().await.remove(E::schema(), id.raw()).await
    }

    /// Whether the entity is managed and not removed.
    pub async fn contains<E: Entity>(&self, id: E::Id) -> bool {
        self.inner.lock().await.contains(E::schema(), id.raw())
    }

    /// Run a descriptor issued by a repository of `root`.
    ///
    /// The result variant follows the query: counts and existence checks
    /// from the method subject, bulk statements as affected rows, everything
    /// else per the descriptor's shape. Page and slice shapes need `request`.
    #[instrument(skip(self, descriptor, args, mapper, request), fields(session = %self.id, entity = root.name, shape = ?descriptor.shape))]
    pub async fn execute<T>(
        &self,
        root: &'static EntitySchema,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        mapper: &RowMapper<T>,
        request: Option<&PageRequest>,
    ) -> Result<QueryResult<T>> {
        let prepared = query::prepare(descriptor, root)?;
        let model = &prepared.model;
        let read_only = descriptor.hints.read_only;
        let mut uow = self.inner.lock().await;

        if let Some(kind) = mutation::BulkKind::of(model) {
            return mutation::execute_bulk(&mut uow, model, args, kind, InvalidationPolicy::Manual)
                .await
                .map(QueryResult::Affected);
        }

        match prepared.subject {
            Subject::Count => {
                let query = uow.compiler().compile(model, args)?;
                uow.count(&query).await.map(QueryResult::Count)
            }
            Subject::Exists => {
                let query = uow.compiler().compile(model, args)?;
                let rows = uow.rows(&query, true).await?;
                Ok(QueryResult::Exists(!rows.is_empty()))
            }
            Subject::Delete => {
                let query = uow.compiler().compile(model, args)?;
                let rows = uow.rows(&query, false).await?;
                let id_field = root.id_field().name;

                let mut removed = 0;
                for row in rows {
                    let id = match row {
                        ResultRow::Entities(entities) => entities
                            .first()
                            .and_then(Option::as_ref)
                            .and_then(|r| r.get(id_field))
                            .and_then(Value::as_int),
                        ResultRow::Values(_) => None,
                    };
                    if let Some(id) = id {
                        uow.remove(root, id).await?;
                        removed += 1;
                    }
                }
                Ok(QueryResult::Affected(removed))
            }
            Subject::Find => match descriptor.shape {
                ResultShape::List => uow
                    .list(model, args, mapper, read_only)
                    .await
                    .map(QueryResult::List),
                ResultShape::Scalar | ResultShape::OptionalSingle => {
                    let mut items = uow.list(model, args, mapper, read_only).await?;
                    if items.len() > 1 {
                        return Err(Error::IncorrectResultSize {
                            expected: 1,
                            actual: items.len(),
                        });
                    }
                    let item = items.pop();
                    match descriptor.shape {
                        ResultShape::Scalar => item
                            .map(QueryResult::One)
                            .ok_or_else(|| Error::NotFound("query returned no result".to_string())),
                        _ => Ok(QueryResult::Optional(item)),
                    }
                }
                ResultShape::Page => {
                    let request = request.ok_or_else(|| {
                        Error::InvalidQuery("page query requires a page request".to_string())
                    })?;
                    let count_model = query::count_model_for(descriptor, model)?;
                    paging::page(&mut uow, model, &count_model, args, request, mapper, read_only)
                        .await
                        .map(QueryResult::Page)
                }
                ResultShape::Slice => {
                    let request = request.ok_or_else(|| {
                        Error::InvalidQuery("slice query requires a page request".to_string())
                    })?;
                    paging::slice(&mut uow, model, args, request, mapper, read_only)
                        .await
                        .map(QueryResult::Slice)
                }
            },
        }
    }

    /// Run a bulk `update` and return the number of rows changed.
    #[instrument(skip(self, descriptor, args), fields(session = %self.id, entity = root.name))]
    pub async fn bulk_update(
        &self,
        root: &'static EntitySchema,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        policy: InvalidationPolicy,
    ) -> Result<u64> {
        self.bulk(root, descriptor, args, BulkKind::Update, policy).await
    }

    /// Run a bulk `delete` and return the number of rows removed.
    #[instrument(skip(self, descriptor, args), fields(session = %self.id, entity = root.name))]
    pub async fn bulk_delete(
        &self,
        root: &'static EntitySchema,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        policy: InvalidationPolicy,
    ) -> Result<u64> {
        self.bulk(root, descriptor, args, BulkKind::Delete, policy).await
    }

    async fn bulk(
        &self,
        root: &'static EntitySchema,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        kind: BulkKind,
        policy: InvalidationPolicy,
    ) -> Result<u64> {
        let prepared = query::prepare(descriptor, root)?;
        let mut uow = self.inner.lock().await;
        mutation::execute_bulk(&mut uow, &prepared.model, args, kind, policy).await
    }

    /// Send every staged write to the store.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush().await
    }

    /// Detach every entity and discard staged writes.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    /// Detach every entity of one type; returns how many were detached.
    pub async fn evict_all(&self, schema: &EntitySchema) -> usize {
        self.inner.lock().await.evict_all(schema)
    }

    /// Flush and commit. Managed entities stay managed.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn commit(&self) -> Result<()> {
        self.inner.lock().await.commit().await
    }

    /// Roll back the transaction and detach everything.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn rollback(&self) -> Result<()> {
        self.inner.lock().await.rollback().await
    }

    /// Whether a failed statement left the session usable only for rollback.
    pub async fn is_rollback_only(&self) -> bool {
        self.inner.lock().await.is_rollback_only()
    }

    pub async fn has_staged_writes(&self) -> bool {
        self.inner.lock().await.has_staged_writes()
    }

    /// Snapshot of the statement counters.
    pub async fn statistics(&self) -> SessionStatistics {
        self.inner.lock().await.statistics().clone()
    }

    pub async fn reset_statistics(&self) {
        self.inner.lock().await.statistics_mut().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use datajpa_domain::{Member, MemberId};

    fn factory() -> SessionFactory {
        SessionFactory::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn test_save_persists_then_merges() {
        let session = factory().open();

        let mut member = session.save(Member::with_age("member1", 10)).await.unwrap();
        let id = member.id.unwrap();
        member.age = 20;
        session.save(member).await.unwrap();
        session.flush().await.unwrap();

        let stats = session.statistics().await;
        assert_eq!(stats.statement_count(), 1);
        assert_eq!(session.get::<Member>(id).await.unwrap().age, 20);
    }

    #[tokio::test]
    async fn test_optional_single_rejects_many() {
        let session = factory().open();
        session.save(Member::with_age("AAA", 10)).await.unwrap();
        session.save(Member::with_age("AAA", 20)).await.unwrap();

        let descriptor =
            QueryDescriptor::derived("findByUsername").with_shape(ResultShape::OptionalSingle);
        let err = session
            .execute(
                Member::schema(),
                &descriptor,
                &Arguments::new().arg("AAA"),
                &RowMapper::<Member>::entity(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncorrectResultSize { expected: 1, actual: 2 }
        ));
    }

    #[tokio::test]
    async fn test_page_without_request_is_invalid() {
        let session = factory().open();
        let descriptor = QueryDescriptor::derived("findByAge").with_shape(ResultShape::Page);
        let err = session
            .execute(
                Member::schema(),
                &descriptor,
                &Arguments::new().arg(10),
                &RowMapper::<Member>::entity(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_derived_delete_removes_each_match() {
        let session = factory().open();
        session.save(Member::with_age("AAA", 10)).await.unwrap();
        session.save(Member::with_age("AAA", 20)).await.unwrap();
        let kept = session.save(Member::with_age("BBB", 30)).await.unwrap();

        let removed = session
            .execute(
                Member::schema(),
                &QueryDescriptor::derived("deleteByUsername"),
                &Arguments::new().arg("AAA"),
                &RowMapper::<Member>::entity(),
                None,
            )
            .await
            .unwrap()
            .into_count()
            .unwrap();
        assert_eq!(removed, 2);

        session.commit().await.unwrap();
        assert!(session.contains::<Member>(kept.id.unwrap()).await);
        assert!(session
            .find::<Member>(MemberId::new(1))
            .await
            .unwrap()
            .is_none());
    }
}
