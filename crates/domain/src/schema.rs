//! Schema metadata describing how an entity maps onto a table.
//!
//! The query engine never inspects entity structs. It resolves property
//! paths, column names and association targets through the static
//! [`EntitySchema`] each entity publishes.

use crate::value::FieldType;
use std::fmt;

/// Role a field plays in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Surrogate primary key
    Id,
    /// Plain mapped column
    Basic,
    /// Foreign key backing a many-to-one association
    ForeignKey,
    /// Set once when the row is first persisted
    CreatedAt,
    /// Refreshed on every update
    UpdatedAt,
    /// Store-managed row version
    Version,
}

/// A mapped column.
#[derive(Debug)]
pub struct FieldDef {
    /// Property name used in queries and rows
    pub name: &'static str,
    /// Column name in the table
    pub column: &'static str,
    /// Column type
    pub ty: FieldType,
    /// Role of the column
    pub kind: FieldKind,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl FieldDef {
    /// Whether application code may assign this field through a bulk update.
    pub fn is_assignable(&self) -> bool {
        matches!(self.kind, FieldKind::Basic | FieldKind::ForeignKey)
    }
}

/// A many-to-one association backed by a foreign-key field.
#[derive(Debug)]
pub struct AssociationDef {
    /// Property name (`team`)
    pub name: &'static str,
    /// Name of the foreign-key field on the owning schema (`team_id`)
    pub foreign_key: &'static str,
    /// Target schema, resolved lazily so schemas may reference each other
    pub target: fn() -> &'static EntitySchema,
}

impl AssociationDef {
    /// The schema this association points at.
    pub fn target_schema(&self) -> &'static EntitySchema {
        (self.target)()
    }
}

/// Table mapping for one entity type.
pub struct EntitySchema {
    /// Entity name used in explicit query text (`Member`)
    pub name: &'static str,
    /// Table name
    pub table: &'static str,
    /// All mapped columns, including id, foreign keys, audit and version
    pub fields: &'static [FieldDef],
    /// Many-to-one associations
    pub associations: &'static [AssociationDef],
    /// Whether updates and deletes check the row version
    pub optimistic_locking: bool,
}

impl EntitySchema {
    /// Look up a field by property name.
    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up an association by property name.
    pub fn association(&self, name: &str) -> Option<&'static AssociationDef> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// First field with the given role.
    pub fn field_of_kind(&self, kind: FieldKind) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.kind == kind)
    }

    /// The primary key field.
    ///
    /// Every schema declares exactly one `Id` field; a schema without one is a
    /// programming error caught by the schema tests.
    pub fn id_field(&self) -> &'static FieldDef {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::Id)
            .unwrap_or(&self.fields[0])
    }

    /// The version field, if the table carries one.
    pub fn version_field(&self) -> Option<&'static FieldDef> {
        self.field_of_kind(FieldKind::Version)
    }

    /// Name of the sequence that hands out identities.
    pub fn sequence_name(&self) -> String {
        format!("{}_seq", self.table)
    }

    /// Fields hydrated when the whole entity is selected.
    pub fn columns(&self) -> impl Iterator<Item = &'static FieldDef> {
        self.fields.iter()
    }
}

impl PartialEq for EntitySchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EntitySchema {}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("name", &self.name)
            .field("table", &self.table)
            .finish()
    }
}

/// Entity-name lookup used when parsing explicit query text.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<&'static EntitySchema>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, schema: &'static EntitySchema) -> Self {
        self.register(schema);
        self
    }

    /// Register a schema; registering the same entity twice is a no-op.
    pub fn register(&mut self, schema: &'static EntitySchema) {
        if !self.schemas.iter().any(|s| s.name == schema.name) {
            self.schemas.push(schema);
        }
    }

    /// Find a schema by entity name.
    pub fn get(&self, name: &str) -> Option<&'static EntitySchema> {
        self.schemas.iter().copied().find(|s| s.name == name)
    }

    /// All registered schemas in registration order.
    pub fn schemas(&self) -> &[&'static EntitySchema] {
        &self.schemas
    }
}
