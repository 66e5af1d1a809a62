//! Scoped resources and access levels
//!
//! A rule targets exactly one of four resource shapes. The access level is
//! tagged with the same scope, and [`validate_shape`] rejects any pairing where
//! the two disagree.

use serde::{Deserialize, Serialize};

use crate::core::{GuardError, GuardResult};

use super::types::{Action, ActionSet};

/// Granularity a rule governs, ordered from most to least specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Cell,
    Row,
    Column,
    Table,
}

impl Scope {
    /// Evaluation order: cell → row → column → table
    pub const PRECEDENCE: [Scope; 4] = [Scope::Cell, Scope::Row, Scope::Column, Scope::Table];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Cell => "cell",
            Scope::Row => "row",
            Scope::Column => "column",
            Scope::Table => "table",
        }
    }

    /// Only rows and cells can be locked
    pub fn is_lockable(&self) -> bool {
        matches!(self, Scope::Row | Scope::Cell)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::PRECEDENCE
            .iter()
            .copied()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| format!("unknown scope '{}'", s))
    }
}

/// The scoped target of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Resource {
    Table {
        table: String,
    },
    Column {
        table: String,
        column: String,
    },
    Row {
        table: String,
        row: String,
    },
    Cell {
        table: String,
        row: String,
        column: String,
    },
}

impl Resource {
    pub fn table(table: impl Into<String>) -> Self {
        Resource::Table {
            table: table.into(),
        }
    }

    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Resource::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn row(table: impl Into<String>, row: impl Into<String>) -> Self {
        Resource::Row {
            table: table.into(),
            row: row.into(),
        }
    }

    pub fn cell(
        table: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Resource::Cell {
            table: table.into(),
            row: row.into(),
            column: column.into(),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Resource::Table { .. } => Scope::Table,
            Resource::Column { .. } => Scope::Column,
            Resource::Row { .. } => Scope::Row,
            Resource::Cell { .. } => Scope::Cell,
        }
    }

    pub fn table_id(&self) -> &str {
        match self {
            Resource::Table { table }
            | Resource::Column { table, .. }
            | Resource::Row { table, .. }
            | Resource::Cell { table, .. } => table,
        }
    }

    fn identifiers(&self) -> Vec<(&'static str, &str)> {
        match self {
            Resource::Table { table } => vec![("table", table.as_str())],
            Resource::Column { table, column } => {
                vec![("table", table.as_str()), ("column", column.as_str())]
            }
            Resource::Row { table, row } => vec![("table", table.as_str()), ("row", row.as_str())],
            Resource::Cell { table, row, column } => vec![
                ("table", table.as_str()),
                ("row", row.as_str()),
                ("column", column.as_str()),
            ],
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Table { table } => write!(f, "table:{}", table),
            Resource::Column { table, column } => write!(f, "column:{}.{}", table, column),
            Resource::Row { table, row } => write!(f, "row:{}#{}", table, row),
            Resource::Cell { table, row, column } => {
                write!(f, "cell:{}#{}.{}", table, row, column)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableAccess {
    Full,
    ReadWrite,
    ReadOnly,
    NoAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnAccess {
    Visible,
    Hidden,
    Readonly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAccess {
    Full,
    AddOnly,
    ReadOnly,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellAccess {
    Readonly,
    Hidden,
    Editable,
}

/// Scope-specific coarse permission label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "level", rename_all = "snake_case")]
pub enum AccessLevel {
    Table(TableAccess),
    Column(ColumnAccess),
    Row(RowAccess),
    Cell(CellAccess),
}

impl AccessLevel {
    pub fn scope(&self) -> Scope {
        match self {
            AccessLevel::Table(_) => Scope::Table,
            AccessLevel::Column(_) => Scope::Column,
            AccessLevel::Row(_) => Scope::Row,
            AccessLevel::Cell(_) => Scope::Cell,
        }
    }

    /// Default action set this level grants
    pub fn implied_actions(&self) -> ActionSet {
        use Action::*;
        match self {
            AccessLevel::Table(TableAccess::Full) => ActionSet::all(),
            AccessLevel::Table(TableAccess::ReadWrite) => {
                ActionSet::of(&[Create, Read, Update, Delete, Lock])
            }
            AccessLevel::Table(TableAccess::ReadOnly) => ActionSet::of(&[Read]),
            AccessLevel::Table(TableAccess::NoAccess) => ActionSet::empty(),

            AccessLevel::Column(ColumnAccess::Visible) => {
                ActionSet::of(&[Create, Read, Update, Delete, Lock])
            }
            AccessLevel::Column(ColumnAccess::Readonly) => ActionSet::of(&[Read]),
            AccessLevel::Column(ColumnAccess::Hidden) => ActionSet::empty(),

            AccessLevel::Row(RowAccess::Full) => ActionSet::all(),
            AccessLevel::Row(RowAccess::AddOnly) => ActionSet::of(&[Create]),
            AccessLevel::Row(RowAccess::ReadOnly) => ActionSet::of(&[Read]),
            AccessLevel::Row(RowAccess::Hidden) => ActionSet::empty(),

            AccessLevel::Cell(CellAccess::Editable) => {
                ActionSet::of(&[Read, Update, Delete, Lock])
            }
            AccessLevel::Cell(CellAccess::Readonly) => ActionSet::of(&[Read]),
            AccessLevel::Cell(CellAccess::Hidden) => ActionSet::empty(),
        }
    }

    /// Whether this level hides the resource from the actor entirely
    pub fn is_hidden(&self) -> bool {
        matches!(
            self,
            AccessLevel::Column(ColumnAccess::Hidden)
                | AccessLevel::Row(RowAccess::Hidden)
                | AccessLevel::Cell(CellAccess::Hidden)
        )
    }

    /// Rank within the scope, higher is more permissive. Only comparable
    /// between levels of the same scope.
    pub fn permissiveness(&self) -> u8 {
        match self {
            AccessLevel::Table(TableAccess::NoAccess) => 0,
            AccessLevel::Table(TableAccess::ReadOnly) => 1,
            AccessLevel::Table(TableAccess::ReadWrite) => 2,
            AccessLevel::Table(TableAccess::Full) => 3,

            AccessLevel::Column(ColumnAccess::Hidden) => 0,
            AccessLevel::Column(ColumnAccess::Readonly) => 1,
            AccessLevel::Column(ColumnAccess::Visible) => 2,

            AccessLevel::Row(RowAccess::Hidden) => 0,
            AccessLevel::Row(RowAccess::AddOnly) => 1,
            AccessLevel::Row(RowAccess::ReadOnly) => 2,
            AccessLevel::Row(RowAccess::Full) => 3,

            AccessLevel::Cell(CellAccess::Hidden) => 0,
            AccessLevel::Cell(CellAccess::Readonly) => 1,
            AccessLevel::Cell(CellAccess::Editable) => 2,
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessLevel::Table(TableAccess::Full) | AccessLevel::Row(RowAccess::Full) => "full",
            AccessLevel::Table(TableAccess::ReadWrite) => "read_write",
            AccessLevel::Table(TableAccess::ReadOnly) | AccessLevel::Row(RowAccess::ReadOnly) => {
                "read_only"
            }
            AccessLevel::Table(TableAccess::NoAccess) => "no_access",
            AccessLevel::Column(ColumnAccess::Visible) => "visible",
            AccessLevel::Column(ColumnAccess::Hidden)
            | AccessLevel::Row(RowAccess::Hidden)
            | AccessLevel::Cell(CellAccess::Hidden) => "hidden",
            AccessLevel::Column(ColumnAccess::Readonly)
            | AccessLevel::Cell(CellAccess::Readonly) => "readonly",
            AccessLevel::Row(RowAccess::AddOnly) => "add_only",
            AccessLevel::Cell(CellAccess::Editable) => "editable",
        };
        write!(f, "{}:{}", self.scope(), name)
    }
}

/// Reject resources with empty identifiers and levels whose scope does not
/// match the resource.
pub fn validate_shape(resource: &Resource, level: &AccessLevel) -> GuardResult<()> {
    for (field, value) in resource.identifiers() {
        if value.trim().is_empty() {
            return Err(GuardError::shape(format!(
                "{} resource has an empty {} identifier",
                resource.scope(),
                field
            )));
        }
    }

    if resource.scope() != level.scope() {
        return Err(GuardError::shape(format!(
            "access level {} cannot govern a {} resource",
            level,
            resource.scope()
        )));
    }

    Ok(())
}
