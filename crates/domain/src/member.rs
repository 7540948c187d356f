//! Member entity and its read models.

use crate::entity::{AuditFields, Entity, Projection};
use crate::errors::{EntityError, EntityResult};
use crate::identifiers::{MemberId, TeamId};
use crate::schema::{AssociationDef, EntitySchema, FieldDef, FieldKind};
use crate::team::{Team, TEAM_SCHEMA};
use crate::value::{FieldType, Row, Value};
use serde::{Deserialize, Serialize};

fn team_schema() -> &'static EntitySchema {
    &TEAM_SCHEMA
}

/// Table mapping for [`Member`].
pub static MEMBER_SCHEMA: EntitySchema = EntitySchema {
    name: "Member",
    table: "member",
    fields: &[
        FieldDef {
            name: "id",
            column: "member_id",
            ty: FieldType::Int,
            kind: FieldKind::Id,
            nullable: false,
        },
        FieldDef {
            name: "username",
            column: "username",
            ty: FieldType::Text,
            kind: FieldKind::Basic,
            nullable: false,
        },
        FieldDef {
            name: "age",
            column: "age",
            ty: FieldType::Int,
            kind: FieldKind::Basic,
            nullable: false,
        },
        FieldDef {
            name: "team_id",
            column: "team_id",
            ty: FieldType::Int,
            kind: FieldKind::ForeignKey,
            nullable: true,
        },
        FieldDef {
            name: "created_date",
            column: "created_date",
            ty: FieldType::Timestamp,
            kind: FieldKind::CreatedAt,
            nullable: true,
        },
        FieldDef {
            name: "updated_date",
            column: "updated_date",
            ty: FieldType::Timestamp,
            kind: FieldKind::UpdatedAt,
            nullable: true,
        },
        FieldDef {
            name: "version",
            column: "version",
            ty: FieldType::Int,
            kind: FieldKind::Version,
            nullable: false,
        },
    ],
    associations: &[AssociationDef {
        name: "team",
        foreign_key: "team_id",
        target: team_schema,
    }],
    optimistic_locking: false,
};

/// A team member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Assigned from the sequence on first save
    pub id: Option<MemberId>,
    /// Login name
    pub username: String,
    /// Age in years
    pub age: i64,
    /// Foreign key of the team, if any
    pub team_id: Option<TeamId>,
    /// Lifecycle timestamps
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl Member {
    /// A member with age 0 and no team.
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_age(username, 0)
    }

    /// A member with the given age and no team.
    pub fn with_age(username: impl Into<String>, age: i64) -> Self {
        Self {
            id: None,
            username: username.into(),
            age,
            team_id: None,
            audit: AuditFields::default(),
        }
    }

    /// A member assigned to an already persisted team.
    pub fn with_team(username: impl Into<String>, age: i64, team: &Team) -> Self {
        let mut member = Self::with_age(username, age);
        member.change_team(team);
        member
    }

    /// Point the association at `team`.
    ///
    /// Only the foreign key is recorded; `team` must already have an identity.
    pub fn change_team(&mut self, team: &Team) {
        self.team_id = team.id;
    }
}

impl Entity for Member {
    type Id = MemberId;

    fn schema() -> &'static EntitySchema {
        &MEMBER_SCHEMA
    }

    fn id(&self) -> Option<MemberId> {
        self.id
    }

    fn assign_id(&mut self, id: MemberId) {
        self.id = Some(id);
    }

    fn audit(&self) -> &AuditFields {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }

    fn to_row(&self) -> Row {
        let row = Row::new()
            .with("id", self.id)
            .with("username", self.username.as_str())
            .with("age", self.age)
            .with("team_id", self.team_id);
        self.audit.write_to(row)
    }

    fn from_row(row: &Row) -> EntityResult<Self> {
        Ok(Self {
            id: row.opt_int("id")?.map(MemberId::new),
            username: row.text("username")?,
            age: row.int("age")?,
            team_id: row.opt_int("team_id")?.map(TeamId::new),
            audit: AuditFields::read_from(row)?,
        })
    }

    fn validate(&self) -> EntityResult<()> {
        if self.age < 0 {
            return Err(EntityError::Invalid {
                entity: "Member",
                message: format!("age must not be negative, got {}", self.age),
            });
        }
        Ok(())
    }
}

/// Flat read model joining a member with its team name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDto {
    /// Member identity
    pub id: MemberId,
    /// Member username
    pub username: String,
    /// Name of the joined team, if any
    pub team_name: Option<String>,
}

impl Projection for MemberDto {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        let [id, username, team_name]: [Value; 3] = values.try_into().map_err(|v: Vec<Value>| {
            EntityError::Projection(format!("MemberDto expects 3 columns, got {}", v.len()))
        })?;

        let id = id
            .as_int()
            .ok_or_else(|| EntityError::Projection(format!("invalid member id {}", id)))?;
        let username = match username {
            Value::Text(s) => s,
            other => {
                return Err(EntityError::Projection(format!(
                    "invalid username {}",
                    other
                )))
            }
        };
        let team_name = match team_name {
            Value::Null => None,
            Value::Text(s) => Some(s),
            other => {
                return Err(EntityError::Projection(format!(
                    "invalid team name {}",
                    other
                )))
            }
        };

        Ok(Self {
            id: MemberId::new(id),
            username,
            team_name,
        })
    }
}

/// Interface-style projection exposing only the username
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameOnly {
    /// Selected username
    pub username: String,
}

impl Projection for UsernameOnly {
    fn from_values(values: Vec<Value>) -> EntityResult<Self> {
        String::from_values(values).map(|username| Self { username })
    }
}

/// A member loaded together with its team in one statement
#[derive(Debug, Clone, PartialEq)]
pub struct MemberWithTeam {
    /// The root entity
    pub member: Member,
    /// The fetch-joined team; `None` when the member has none
    pub team: Option<Team>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_row_round_trip() {
        let mut team = Team::new("teamA");
        team.assign_id(TeamId::new(5));

        let mut member = Member::with_team("member1", 10, &team);
        member.assign_id(MemberId::new(1));

        let row = member.to_row();
        assert_eq!(row.get("team_id"), Some(&Value::Int(5)));
        assert_eq!(Member::from_row(&row).unwrap(), member);
    }

    #[test]
    fn test_change_team_records_foreign_key() {
        let mut team = Team::new("teamB");
        team.assign_id(TeamId::new(9));

        let mut member = Member::new("member1");
        assert!(member.team_id.is_none());
        member.change_team(&team);
        assert_eq!(member.team_id, Some(TeamId::new(9)));
    }

    #[test]
    fn test_username_only_projection() {
        let projected = UsernameOnly::from_values(vec![Value::from("m1")]).unwrap();
        assert_eq!(projected.username, "m1");
        assert!(UsernameOnly::from_values(vec![Value::Null]).is_err());
    }

    #[test]
    fn test_negative_age_is_invalid() {
        let member = Member::with_age("member1", -1);
        assert!(matches!(
            member.validate(),
            Err(EntityError::Invalid { entity: "Member", .. })
        ));
    }

    #[test]
    fn test_member_dto_projection() {
        let dto = MemberDto::from_values(vec![
            Value::from(1),
            Value::from("AAA"),
            Value::from("TeamA"),
        ])
        .unwrap();
        assert_eq!(dto.username, "AAA");
        assert_eq!(dto.team_name.as_deref(), Some("TeamA"));

        let no_team =
            MemberDto::from_values(vec![Value::from(2), Value::from("BBB"), Value::Null]).unwrap();
        assert!(no_team.team_name.is_none());

        assert!(MemberDto::from_values(vec![Value::from(1)]).is_err());
    }
}
