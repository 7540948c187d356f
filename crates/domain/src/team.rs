//! Team entity.
//!
//! Teams do not hold their members. The inverse side of `Member.team` is a
//! lookup over the `team_id` foreign key (see the team repository).

use crate::entity::{AuditFields, Entity};
use crate::errors::EntityResult;
use crate::identifiers::TeamId;
use crate::schema::{EntitySchema, FieldDef, FieldKind};
use crate::value::{FieldType, Row};
use serde::{Deserialize, Serialize};

/// Table mapping for [`Team`].
pub static TEAM_SCHEMA: EntitySchema = EntitySchema {
    name: "Team",
    table: "team",
    fields: &[
        FieldDef {
            name: "id",
            column: "team_id",
            ty: FieldType::Int,
            kind: FieldKind::Id,
            nullable: false,
        },
        FieldDef {
            name: "name",
            column: "name",
            ty: FieldType::Text,
            kind: FieldKind::Basic,
            nullable: false,
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
    associations: &[],
    optimistic_locking: true,
};

/// A team members can belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    /// Assigned from the sequence on first save
    pub id: Option<TeamId>,
    /// Display name
    pub name: String,
    /// Lifecycle timestamps
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl Team {
    /// A new, unsaved team.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            audit: AuditFields::default(),
        }
    }
}

impl Entity for Team {
    type Id = TeamId;

    fn schema() -> &'static EntitySchema {
        &TEAM_SCHEMA
    }

    fn id(&self) -> Option<TeamId> {
        self.id
    }

    fn assign_id(&mut self, id: TeamId) {
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
            .with("name", self.name.as_str());
        self.audit.write_to(row)
    }

    fn from_row(row: &Row) -> EntityResult<Self> {
        Ok(Self {
            id: row.opt_int("id")?.map(TeamId::new),
            name: row.text("name")?,
            audit: AuditFields::read_from(row)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_row_round_trip() {
        let mut team = Team::new("teamA");
        team.assign_id(TeamId::new(1));
        let restored = Team::from_row(&team.to_row()).unwrap();
        assert_eq!(restored, team);
    }

    #[test]
    fn test_new_team_has_no_identity() {
        let team = Team::new("teamA");
        assert!(team.id().is_none());
        assert_eq!(team.to_row().get("id"), Some(&crate::value::Value::Null));
    }
}
