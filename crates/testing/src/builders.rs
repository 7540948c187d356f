//! Fluent builders for constructing test entities.

use chrono::{DateTime, Utc};
use datajpa_domain::{AuditFields, Member, MemberId, Team, TeamId};

/// Builder for creating Member test instances
#[derive(Clone)]
pub struct MemberBuilder {
    id: Option<MemberId>,
    username: String,
    age: i64,
    team_id: Option<TeamId>,
    audit: AuditFields,
}

impl MemberBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            username: "member".to_string(),
            age: 0,
            team_id: None,
            audit: AuditFields::default(),
        }
    }

    /// Pretend the member was already saved under `id`
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(MemberId::new(id));
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_age(mut self, age: i64) -> Self {
        self.age = age;
        self
    }

    pub fn with_team(mut self, team: &Team) -> Self {
        self.team_id = team.id;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.audit.created_date = Some(at);
        self.audit.updated_date = Some(at);
        self
    }

    pub fn build(self) -> Member {
        Member {
            id: self.id,
            username: self.username,
            age: self.age,
            team_id: self.team_id,
            audit: self.audit,
        }
    }
}

impl Default for MemberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating Team test instances
#[derive(Clone)]
pub struct TeamBuilder {
    id: Option<TeamId>,
    name: String,
}

impl TeamBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            name: "teamA".to_string(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(TeamId::new(id));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> Team {
        let mut team = Team::new(self.name);
        team.id = self.id;
        team
    }
}

impl Default for TeamBuilder {
    fn default() -> Self {
        Self::new()
    }
}
