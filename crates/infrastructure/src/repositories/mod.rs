//! Repositories over a [`Session`].
//!
//! [`EntityRepository`] is the generic, session-backed repository: it
//! implements [`CrudRepository`] for any entity and runs query descriptors.
//! Entity-specific query methods are traits implemented for
//! `EntityRepository<Member>` / `EntityRepository<Team>`. The plain
//! repositories issue their statements by hand against the session.

mod member_repository;
mod plain;
mod team_repository;

pub use member_repository::*;
pub use plain::*;
pub use team_repository::*;

use crate::mutation::InvalidationPolicy;
use crate::query::{Arguments, QueryDescriptor, QueryModel, ResultShape};
use crate::session::{QueryResult, RowMapper, Session};
use crate::Result;
use async_trait::async_trait;
use datajpa_common::{Page, PageRequest, Slice, Sort};
use datajpa_domain::{Entity, Projection};
use std::fmt;
use std::marker::PhantomData;
use tracing::instrument;

/// Common repository trait for CRUD operations.
#[async_trait]
pub trait CrudRepository<E: Entity>: Send + Sync {
    /// Stage an insert (no identity) or an update (identity present).
    async fn save(&self, entity: E) -> Result<E>;

    async fn save_all(&self, entities: Vec<E>) -> Result<Vec<E>>;

    /// `save` followed by a flush.
    async fn save_and_flush(&self, entity: E) -> Result<E>;

    /// Find an entity by its ID.
    async fn find_by_id(&self, id: E::Id) -> Result<Option<E>>;

    /// Get an entity by its ID; `NotFound` when absent.
    async fn get_by_id(&self, id: E::Id) -> Result<E>;

    /// Check if an entity exists.
    async fn exists_by_id(&self, id: E::Id) -> Result<bool>;

    async fn find_all(&self) -> Result<Vec<E>>;

    async fn find_all_sorted(&self, sort: Sort) -> Result<Vec<E>>;

    async fn find_all_paged(&self, request: &PageRequest) -> Result<Page<E>>;

    /// Count all entities.
    async fn count(&self) -> Result<u64>;

    /// Stage removal. Removing an entity that is already gone is `NotFound`.
    async fn delete(&self, entity: &E) -> Result<()>;

    async fn delete_by_id(&self, id: E::Id) -> Result<()>;

    /// Send staged writes to the store.
    async fn flush(&self) -> Result<()>;
}

/// Session-backed repository for `E`.
pub struct EntityRepository<E> {
    session: Session,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityRepository<E> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for EntityRepository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRepository")
            .field("entity", &E::schema().name)
            .field("session", &self.session)
            .finish()
    }
}

impl<E: Entity> EntityRepository<E> {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            _entity: PhantomData,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run a descriptor with an explicit row mapper.
    pub async fn query<T>(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        mapper: &RowMapper<T>,
        request: Option<&PageRequest>,
    ) -> Result<QueryResult<T>> {
        self.session
            .execute(E::schema(), descriptor, args, mapper, request)
            .await
    }

    pub async fn list(&self, descriptor: &QueryDescriptor, args: &Arguments) -> Result<Vec<E>> {
        self.query(descriptor, args, &RowMapper::entity(), None)
            .await?
            .into_list()
    }

    /// List of projections built from the selected columns.
    pub async fn list_as<P: Projection>(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
    ) -> Result<Vec<P>> {
        self.query(descriptor, args, &RowMapper::projection(), None)
            .await?
            .into_list()
    }

    /// Zero or one entity; more is `IncorrectResultSize`.
    pub async fn optional(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
    ) -> Result<Option<E>> {
        let descriptor = descriptor.clone().with_shape(ResultShape::OptionalSingle);
        self.query(&descriptor, args, &RowMapper::entity(), None)
            .await?
            .into_optional()
    }

    /// Exactly one entity; none is `NotFound`, more is `IncorrectResultSize`.
    pub async fn single(&self, descriptor: &QueryDescriptor, args: &Arguments) -> Result<E> {
        let descriptor = descriptor.clone().with_shape(ResultShape::Scalar);
        self.query(&descriptor, args, &RowMapper::entity(), None)
            .await?
            .into_one()
    }

    pub async fn page(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        request: &PageRequest,
    ) -> Result<Page<E>> {
        let descriptor = descriptor.clone().with_shape(ResultShape::Page);
        self.query(&descriptor, args, &RowMapper::entity(), Some(request))
            .await?
            .into_page()
    }

    pub async fn slice(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        request: &PageRequest,
    ) -> Result<Slice<E>> {
        let descriptor = descriptor.clone().with_shape(ResultShape::Slice);
        self.query(&descriptor, args, &RowMapper::entity(), Some(request))
            .await?
            .into_slice()
    }

    /// Run a `count...` method or a `select count(...)` text.
    pub async fn count_by(&self, descriptor: &QueryDescriptor, args: &Arguments) -> Result<u64> {
        self.query(descriptor, args, &RowMapper::<E>::entity(), None)
            .await?
            .into_count()
    }

    pub async fn exists_by(&self, descriptor: &QueryDescriptor, args: &Arguments) -> Result<bool> {
        self.query(descriptor, args, &RowMapper::<E>::entity(), None)
            .await?
            .into_exists()
    }

    pub async fn bulk_update(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        policy: InvalidationPolicy,
    ) -> Result<u64> {
        self.session
            .bulk_update(E::schema(), descriptor, args, policy)
            .await
    }

    pub async fn bulk_delete(
        &self,
        descriptor: &QueryDescriptor,
        args: &Arguments,
        policy: InvalidationPolicy,
    ) -> Result<u64> {
        self.session
            .bulk_delete(E::schema(), descriptor, args, policy)
            .await
    }

    fn all() -> QueryDescriptor {
        QueryDescriptor::criteria(QueryModel::select(E::schema().name))
    }
}

#[async_trait]
impl<E: Entity> CrudRepository<E> for EntityRepository<E> {
    async fn save(&self, entity: E) -> Result<E> {
        self.session.save(entity).await
    }

    #[instrument(skip(self, entities), fields(entity = E::schema().name, count = entities.len()))]
    async fn save_all(&self, entities: Vec<E>) -> Result<Vec<E>> {
        let mut saved = Vec::with_capacity(entities.len());
        for entity in entities {
            saved.push(self.session.save(entity).await?);
        }
        Ok(saved)
    }

    async fn save_and_flush(&self, entity: E) -> Result<E> {
        let saved = self.session.save(entity).await?;
        self.session.flush().await?;
        Ok(saved)
    }

    async fn find_by_id(&self, id: E::Id) -> Result<Option<E>> {
        self.session.find::<E>(id).await
    }

    async fn get_by_id(&self, id: E::Id) -> Result<E> {
        self.session.get::<E>(id).await
    }

    async fn exists_by_id(&self, id: E::Id) -> Result<bool> {
        Ok(self.session.find::<E>(id).await?.is_some())
    }

    async fn find_all(&self) -> Result<Vec<E>> {
        self.list(&Self::all(), &Arguments::new()).await
    }

    async fn find_all_sorted(&self, sort: Sort) -> Result<Vec<E>> {
        self.list(&Self::all().sorted(sort), &Arguments::new()).await
    }

    async fn find_all_paged(&self, request: &PageRequest) -> Result<Page<E>> {
        self.page(&Self::all(), &Arguments::new(), request).await
    }

    async fn count(&self) -> Result<u64> {
        let descriptor = QueryDescriptor::criteria(QueryModel::count(E::schema().name));
        self.count_by(&descriptor, &Arguments::new()).await
    }

    async fn delete(&self, entity: &E) -> Result<()> {
        self.session.remove(entity).await
    }

    async fn delete_by_id(&self, id: E::Id) -> Result<()> {
        self.session.remove_by_id::<E>(id).await
    }

    async fn flush(&self) -> Result<()> {
        self.session.flush().await
    }
}
