//! Member repository.

use super::{CrudRepository, EntityRepository};
use crate::mutation::InvalidationPolicy;
use crate::query::{Arguments, LockMode, QueryDescriptor};
use crate::session::RowMapper;
use crate::Result;
use async_trait::async_trait;
use datajpa_common::{Page, PageRequest, Slice};
use datajpa_domain::{Member, MemberDto, MemberWithTeam, Team, UsernameOnly};
use once_cell::sync::Lazy;
use std::time::Duration;
use tracing::instrument;

static FIND_BY_USERNAME_AND_AGE_GREATER_THAN: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findByUsernameAndAgeGreaterThan"));

static FIND_USER: Lazy<QueryDescriptor> = Lazy::new(|| {
    QueryDescriptor::text("select m from Member m where m.username = :username and m.age = :age")
});

static FIND_USERNAME_LIST: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::text("select m.username from Member m"));

static FIND_MEMBER_DTO: Lazy<QueryDescriptor> = Lazy::new(|| {
    QueryDescriptor::text(
        "select new MemberDto(m.id, m.username, t.name) from Member m join m.team t",
    )
});

static FIND_BY_NAMES: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::text("select m from Member m where m.username in :names"));

static FIND_BY_USERNAME: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findByUsername"));

static FIND_BY_AGE: Lazy<QueryDescriptor> = Lazy::new(|| QueryDescriptor::derived("findByAge"));

static FIND_WITH_TEAM_BY_AGE: Lazy<QueryDescriptor> = Lazy::new(|| {
    QueryDescriptor::text("select m from Member m left join m.team t where m.age = :age")
        .count_query("select count(m) from Member m where m.age = :age")
});

static BULK_AGE_PLUS: Lazy<QueryDescriptor> = Lazy::new(|| {
    QueryDescriptor::text("update Member m set m.age = m.age + 1 where m.age >= :age")
});

static FIND_MEMBER_FETCH_JOIN: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::text("select m from Member m left join fetch m.team"));

static FIND_ALL_WITH_TEAM: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findAll").fetch("team"));

static FIND_ENTITY_GRAPH_BY_USERNAME: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findEntityGraphByUsername").fetch("team"));

static FIND_READ_ONLY_BY_USERNAME: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findReadOnlyByUsername").read_only());

static FIND_LOCK_BY_USERNAME: Lazy<QueryDescriptor> = Lazy::new(|| {
    QueryDescriptor::derived("findLockByUsername").lock(LockMode::PessimisticWrite)
});

static FIND_PROJECTIONS_BY_USERNAME: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findProjectionsByUsername").project(&["username"]));

static FIND_MEMBER_CUSTOM: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::text("select m from Member m"));

/// Repository trait for member queries.
#[async_trait]
pub trait MemberRepository: CrudRepository<Member> {
    /// Members with the given username older than `age`.
    async fn find_by_username_and_age_greater_than(
        &self,
        username: &str,
        age: i64,
    ) -> Result<Vec<Member>>;

    /// Members matching username and age exactly.
    async fn find_user(&self, username: &str, age: i64) -> Result<Vec<Member>>;

    async fn find_username_list(&self) -> Result<Vec<String>>;

    /// Members joined with their team name. Members without a team are
    /// excluded.
    async fn find_member_dto(&self) -> Result<Vec<MemberDto>>;

    async fn find_by_names(&self, names: &[&str]) -> Result<Vec<Member>>;

    async fn find_list_by_username(&self, username: &str) -> Result<Vec<Member>>;

    /// Exactly one member; `NotFound` or `IncorrectResultSize` otherwise.
    async fn find_member_by_username(&self, username: &str) -> Result<Member>;

    async fn find_optional_by_username(&self, username: &str) -> Result<Option<Member>>;

    /// Page of members of one age, with a total count.
    async fn find_by_age(&self, age: i64, request: &PageRequest) -> Result<Page<Member>>;

    /// Page over an explicit join query with its own count query.
    async fn find_with_team_by_age(&self, age: i64, request: &PageRequest)
        -> Result<Page<Member>>;

    /// Slice of members of one age; never counts.
    async fn find_slice_by_age(&self, age: i64, request: &PageRequest) -> Result<Slice<Member>>;

    /// Add one year to every member at least `age` old; returns rows changed.
    async fn bulk_age_plus(&self, age: i64, policy: InvalidationPolicy) -> Result<u64>;

    /// Members with their team loaded by the same statement.
    async fn find_member_fetch_join(&self) -> Result<Vec<MemberWithTeam>>;

    async fn find_all_with_team(&self) -> Result<Vec<MemberWithTeam>>;

    async fn find_entity_graph_by_username(&self, username: &str) -> Result<Vec<MemberWithTeam>>;

    /// Loaded read-only: later saves of the result are ignored.
    async fn find_read_only_by_username(&self, username: &str) -> Result<Option<Member>>;

    /// Locks matching rows `FOR UPDATE` until the session ends.
    async fn find_lock_by_username(&self, username: &str) -> Result<Vec<Member>>;

    /// Like `find_lock_by_username` with a per-query lock wait.
    async fn find_lock_by_username_within(
        &self,
        username: &str,
        timeout: Duration,
    ) -> Result<Vec<Member>>;

    async fn find_projections_by_username(&self, username: &str) -> Result<Vec<UsernameOnly>>;

    /// Hand-written query outside the derivation conventions.
    async fn find_member_custom(&self) -> Result<Vec<Member>>;

    async fn count_by_age(&self, age: i64) -> Result<u64>;

    async fn exists_by_username(&self, username: &str) -> Result<bool>;

    /// Remove every member with the username, one by one through the session.
    async fn delete_by_username(&self, username: &str) -> Result<u64>;
}

/// Session-backed member repository.
pub type SessionMemberRepository = EntityRepository<Member>;

fn with_team(pairs: Vec<(Member, Option<Team>)>) -> Vec<MemberWithTeam> {
    pairs
        .into_iter()
        .map(|(member, team)| MemberWithTeam { member, team })
        .collect()
}

#[async_trait]
impl MemberRepository for EntityRepository<Member> {
    #[instrument(skip(self))]
    async fn find_by_username_and_age_greater_than(
        &self,
        username: &str,
        age: i64,
    ) -> Result<Vec<Member>> {
        let args = Arguments::new().arg(username).arg(age);
        self.list(&FIND_BY_USERNAME_AND_AGE_GREATER_THAN, &args).await
    }

    #[instrument(skip(self))]
    async fn find_user(&self, username: &str, age: i64) -> Result<Vec<Member>> {
        let args = Arguments::new()
            .named("username", username)
            .named("age", age);
        self.list(&FIND_USER, &args).await
    }

    async fn find_username_list(&self) -> Result<Vec<String>> {
        self.list_as(&FIND_USERNAME_LIST, &Arguments::new()).await
    }

    async fn find_member_dto(&self) -> Result<Vec<MemberDto>> {
        self.list_as(&FIND_MEMBER_DTO, &Arguments::new()).await
    }

    #[instrument(skip(self))]
    async fn find_by_names(&self, names: &[&str]) -> Result<Vec<Member>> {
        let args = Arguments::new().named("names", names.to_vec());
        self.list(&FIND_BY_NAMES, &args).await
    }

    async fn find_list_by_username(&self, username: &str) -> Result<Vec<Member>> {
        self.list(&FIND_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    async fn find_member_by_username(&self, username: &str) -> Result<Member> {
        self.single(&FIND_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    async fn find_optional_by_username(&self, username: &str) -> Result<Option<Member>> {
        self.optional(&FIND_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    #[instrument(skip(self))]
    async fn find_by_age(&self, age: i64, request: &PageRequest) -> Result<Page<Member>> {
        self.page(&FIND_BY_AGE, &Arguments::new().arg(age), request)
            .await
    }

    #[instrument(skip(self))]
    async fn find_with_team_by_age(
        &self,
        age: i64,
        request: &PageRequest,
    ) -> Result<Page<Member>> {
        self.page(&FIND_WITH_TEAM_BY_AGE, &Arguments::new().named("age", age), request)
            .await
    }

    #[instrument(skip(self))]
    async fn find_slice_by_age(&self, age: i64, request: &PageRequest) -> Result<Slice<Member>> {
        self.slice(&FIND_BY_AGE, &Arguments::new().arg(age), request)
            .await
    }

    #[instrument(skip(self))]
    async fn bulk_age_plus(&self, age: i64, policy: InvalidationPolicy) -> Result<u64> {
        self.bulk_update(&BULK_AGE_PLUS, &Arguments::new().named("age", age), policy)
            .await
    }

    async fn find_member_fetch_join(&self) -> Result<Vec<MemberWithTeam>> {
        let pairs = self
            .query(
                &FIND_MEMBER_FETCH_JOIN,
                &Arguments::new(),
                &RowMapper::fetch_joined(),
                None,
            )
            .await?
            .into_list()?;
        Ok(with_team(pairs))
    }

    async fn find_all_with_team(&self) -> Result<Vec<MemberWithTeam>> {
        let pairs = self
            .query(
                &FIND_ALL_WITH_TEAM,
                &Arguments::new(),
                &RowMapper::fetch_joined(),
                None,
            )
            .await?
            .into_list()?;
        Ok(with_team(pairs))
    }

    async fn find_entity_graph_by_username(&self, username: &str) -> Result<Vec<MemberWithTeam>> {
        let pairs = self
            .query(
                &FIND_ENTITY_GRAPH_BY_USERNAME,
                &Arguments::new().arg(username),
                &RowMapper::fetch_joined(),
                None,
            )
            .await?
            .into_list()?;
        Ok(with_team(pairs))
    }

    async fn find_read_only_by_username(&self, username: &str) -> Result<Option<Member>> {
        self.optional(&FIND_READ_ONLY_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    #[instrument(skip(self))]
    async fn find_lock_by_username(&self, username: &str) -> Result<Vec<Member>> {
        self.list(&FIND_LOCK_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    #[instrument(skip(self))]
    async fn find_lock_by_username_within(
        &self,
        username: &str,
        timeout: Duration,
    ) -> Result<Vec<Member>> {
        let descriptor = FIND_LOCK_BY_USERNAME.clone().lock_timeout(timeout);
        self.list(&descriptor, &Arguments::new().arg(username)).await
    }

    async fn find_projections_by_username(&self, username: &str) -> Result<Vec<UsernameOnly>> {
        self.list_as(&FIND_PROJECTIONS_BY_USERNAME, &Arguments::new().arg(username))
            .await
    }

    async fn find_member_custom(&self) -> Result<Vec<Member>> {
        self.list(&FIND_MEMBER_CUSTOM, &Arguments::new()).await
    }

    async fn count_by_age(&self, age: i64) -> Result<u64> {
        self.count_by(&QueryDescriptor::derived("countByAge"), &Arguments::new().arg(age))
            .await
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool> {
        self.exists_by(
            &QueryDescriptor::derived("existsByUsername"),
            &Arguments::new().arg(username),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete_by_username(&self, username: &str) -> Result<u64> {
        self.query(
            &QueryDescriptor::derived("deleteByUsername"),
            &Arguments::new().arg(username),
            &RowMapper::<Member>::entity(),
            None,
        )
        .await?
        .into_count()
    }
}
