//! Team repository.

use super::{CrudRepository, EntityRepository};
use crate::query::{Arguments, QueryDescriptor};
use crate::Result;
use async_trait::async_trait;
use datajpa_common::Sort;
use datajpa_domain::{Member, Team, TeamId};
use once_cell::sync::Lazy;

static FIND_BY_NAME: Lazy<QueryDescriptor> = Lazy::new(|| QueryDescriptor::derived("findByName"));

static FIND_MEMBERS_BY_TEAM: Lazy<QueryDescriptor> =
    Lazy::new(|| QueryDescriptor::derived("findByTeamId").sorted(Sort::asc("id")));

/// Repository trait for team queries.
#[async_trait]
pub trait TeamRepository: CrudRepository<Team> {
    async fn find_by_name(&self, name: &str) -> Result<Option<Team>>;

    /// Members whose `team_id` points at `team_id`, by member id.
    async fn members_of(&self, team_id: TeamId) -> Result<Vec<Member>>;
}

/// Session-backed team repository.
pub type SessionTeamRepository = EntityRepository<Team>;

#[async_trait]
impl TeamRepository for EntityRepository<Team> {
    async fn find_by_name(&self, name: &str) -> Result<Option<Team>> {
        self.optional(&FIND_BY_NAME, &Arguments::new().arg(name)).await
    }

    async fn members_of(&self, team_id: TeamId) -> Result<Vec<Member>> {
        EntityRepository::<Member>::new(self.session().clone())
            .list(&FIND_MEMBERS_BY_TEAM, &Arguments::new().arg(team_id))
            .await
    }
}
