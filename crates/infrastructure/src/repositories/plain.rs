//! Hand-written repositories.
//!
//! These spell out every statement against the session instead of deriving
//! it from a method name. They exist side by side with the derived
//! repositories and must observe the same rows.

use crate::mutation::InvalidationPolicy;
use crate::query::{Arguments, Predicate, QueryDescriptor, QueryModel};
use crate::session::{RowMapper, Session};
use crate::Result;
use datajpa_common::Sort;
use datajpa_domain::{Entity, Member, MemberId, Team, TeamId};
use tracing::instrument;

/// Member repository written against the session directly.
#[derive(Debug, Clone)]
pub struct PlainMemberRepository {
    session: Session,
}

impl PlainMemberRepository {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub async fn save(&self, member: Member) -> Result<Member> {
        self.session.save(member).await
    }

    pub async fn delete(&self, member: &Member) -> Result<()> {
        self.session.remove(member).await
    }

    pub async fn find_all(&self) -> Result<Vec<Member>> {
        self.list(
            &QueryDescriptor::text("select m from Member m"),
            &Arguments::new(),
        )
        .await
    }

    pub async fn find_by_id(&self, id: MemberId) -> Result<Option<Member>> {
        self.session.find::<Member>(id).await
    }

    /// Like `find_by_id`, but absence is an error.
    pub async fn find(&self, id: MemberId) -> Result<Member> {
        self.session.get::<Member>(id).await
    }

    pub async fn count(&self) -> Result<u64> {
        let descriptor = QueryDescriptor::text("select count(m) from Member m");
        self.session
            .execute(
                Member::schema(),
                &descriptor,
                &Arguments::new(),
                &RowMapper::<Member>::entity(),
                None,
            )
            .await?
            .into_count()
    }

    #[instrument(skip(self))]
    pub async fn find_by_username_and_age_greater_than(
        &self,
        username: &str,
        age: i64,
    ) -> Result<Vec<Member>> {
        let descriptor = QueryDescriptor::text(
            "select m from Member m where m.username = :username and m.age > :age",
        );
        let args = Arguments::new()
            .named("username", username)
            .named("age", age);
        self.list(&descriptor, &args).await
    }

    /// Members of one age by descending username, windowed by hand.
    #[instrument(skip(self))]
    pub async fn find_by_page(&self, age: i64, offset: u64, limit: u64) -> Result<Vec<Member>> {
        let mut model = QueryModel::select("Member")
            .filter(Predicate::eq("age", age))
            .order_by(Sort::desc("username"))
            .limit(limit);
        model.offset = (offset > 0).then_some(offset);
        self.list(&QueryDescriptor::criteria(model), &Arguments::new())
            .await
    }

    pub async fn total_count(&self, age: i64) -> Result<u64> {
        let model = QueryModel::count("Member").filter(Predicate::eq("age", age));
        self.session
            .execute(
                Member::schema(),
                &QueryDescriptor::criteria(model),
                &Arguments::new(),
                &RowMapper::<Member>::entity(),
                None,
            )
            .await?
            .into_count()
    }

    #[instrument(skip(self))]
    pub async fn bulk_age_plus(&self, age: i64, policy: InvalidationPolicy) -> Result<u64> {
        let model = QueryModel::update("Member")
            .increment("age", 1)
            .filter(Predicate::ge("age", age));
        self.session
            .bulk_update(
                Member::schema(),
                &QueryDescriptor::criteria(model),
                &Arguments::new(),
                policy,
            )
            .await
    }

    async fn list(&self, descriptor: &QueryDescriptor, args: &Arguments) -> Result<Vec<Member>> {
        self.session
            .execute(
                Member::schema(),
                descriptor,
                args,
                &RowMapper::entity(),
                None,
            )
            .await?
            .into_list()
    }
}

/// Team repository written against the session directly.
#[derive(Debug, Clone)]
pub struct PlainTeamRepository {
    session: Session,
}

impl PlainTeamRepository {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub async fn save(&self, team: Team) -> Result<Team> {
        self.session.save(team).await
    }

    pub async fn delete(&self, team: &Team) -> Result<()> {
        self.session.remove(team).await
    }

    pub async fn find_all(&self) -> Result<Vec<Team>> {
        self.session
            .execute(
                Team::schema(),
                &QueryDescriptor::text("select t from Team t"),
                &Arguments::new(),
                &RowMapper::entity(),
                None,
            )
            .await?
            .into_list()
    }

    pub async fn find_by_id(&self, id: TeamId) -> Result<Option<Team>> {
        self.session.find::<Team>(id).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.session
            .execute(
                Team::schema(),
                &QueryDescriptor::text("select count(t) from Team t"),
                &Arguments::new(),
                &RowMapper::<Team>::entity(),
                None,
            )
            .await?
            .into_count()
    }
}
