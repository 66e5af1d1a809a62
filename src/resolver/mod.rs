//! Scope Resolver
//!
//! Finds, for a coordinate, the enabled grant rules at each scope whose
//! resource is exactly the coordinate's projection onto that scope. There is
//! no prefix or wildcard matching. Candidates are split by actor form so the
//! evaluator can prefer user-specific grants.

use std::sync::Arc;

use crate::core::GuardResult;
use crate::rules::{Actor, PermissionRule, Resource, Scope};
use crate::store::RuleStore;

/// A point in a base the caller wants to act on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub table: String,
    pub column: Option<String>,
    pub row: Option<String>,
}

impl Coordinate {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: None,
            row: None,
        }
    }

    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::table(table).with_column(column)
    }

    pub fn row(table: impl Into<String>, row: impl Into<String>) -> Self {
        Self::table(table).with_row(row)
    }

    pub fn cell(
        table: impl Into<String>,
        row: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::table(table).with_row(row).with_column(column)
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_row(mut self, row: impl Into<String>) -> Self {
        self.row = Some(row.into());
        self
    }

    /// The resource this coordinate names at `scope`, if it reaches that deep
    pub fn resource_at(&self, scope: Scope) -> Option<Resource> {
        match scope {
            Scope::Table => Some(Resource::table(&self.table)),
            Scope::Column => self
                .column
                .as_ref()
                .map(|c| Resource::column(&self.table, c)),
            Scope::Row => self.row.as_ref().map(|r| Resource::row(&self.table, r)),
            Scope::Cell => match (&self.row, &self.column) {
                (Some(r), Some(c)) => Some(Resource::cell(&self.table, r, c)),
                _ => None,
            },
        }
    }

    /// Resources to fetch, most specific first
    pub fn candidate_resources(&self) -> Vec<Resource> {
        Scope::PRECEDENCE
            .iter()
            .filter_map(|scope| self.resource_at(*scope))
            .collect()
    }

    /// Lockable resources covering this coordinate: the cell and its row
    pub fn lockable_resources(&self) -> Vec<Resource> {
        [Scope::Cell, Scope::Row]
            .iter()
            .filter_map(|scope| self.resource_at(*scope))
            .collect()
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table)?;
        if let Some(row) = &self.row {
            write!(f, "#{}", row)?;
        }
        if let Some(column) = &self.column {
            write!(f, ".{}", column)?;
        }
        Ok(())
    }
}

/// Candidate rules at one scope, partitioned by actor form
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeCandidates {
    pub users: Vec<PermissionRule>,
    pub roles: Vec<PermissionRule>,
    pub members: Vec<PermissionRule>,
}

impl ScopeCandidates {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.roles.is_empty() && self.members.is_empty()
    }

    fn push(&mut self, rule: PermissionRule) {
        match rule.actor {
            Actor::User { .. } => self.users.push(rule),
            Actor::Role { .. } => self.roles.push(rule),
            Actor::AllMembers => self.members.push(rule),
        }
    }
}

/// Resolution result: one candidate set per scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedScopes {
    pub cell: ScopeCandidates,
    pub row: ScopeCandidates,
    pub column: ScopeCandidates,
    pub table: ScopeCandidates,
}

impl ResolvedScopes {
    pub fn at(&self, scope: Scope) -> &ScopeCandidates {
        match scope {
            Scope::Cell => &self.cell,
            Scope::Row => &self.row,
            Scope::Column => &self.column,
            Scope::Table => &self.table,
        }
    }

    fn at_mut(&mut self, scope: Scope) -> &mut ScopeCandidates {
        match scope {
            Scope::Cell => &mut self.cell,
            Scope::Row => &mut self.row,
            Scope::Column => &mut self.column,
            Scope::Table => &mut self.table,
        }
    }

    pub fn is_empty(&self) -> bool {
        Scope::PRECEDENCE.iter().all(|s| self.at(*s).is_empty())
    }
}

/// Resolves coordinates against the rule store
#[derive(Clone)]
pub struct ScopeResolver {
    store: Arc<dyn RuleStore>,
}

impl ScopeResolver {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Every stored rule on any of the coordinate's candidate resources,
    /// including disabled rules and lock anchors
    pub async fn fetch(&self, base: &str, coordinate: &Coordinate) -> GuardResult<Vec<PermissionRule>> {
        self.store
            .rules_for(base, &coordinate.candidate_resources())
            .await
    }

    /// Fetch and partition the rules applying to `coordinate` in `base`
    pub async fn resolve(&self, base: &str, coordinate: &Coordinate) -> GuardResult<ResolvedScopes> {
        let rules = self.fetch(base, coordinate).await?;
        Ok(partition(base, coordinate, rules))
    }
}

/// Partition already-fetched rules. Disabled rules, lock anchors, other bases
/// and non-matching resources are dropped.
pub fn partition(
    base: &str,
    coordinate: &Coordinate,
    rules: impl IntoIterator<Item = PermissionRule>,
) -> ResolvedScopes {
    let mut resolved = ResolvedScopes::default();
    for rule in rules {
        if !rule.is_effective() || rule.base != base {
            continue;
        }
        let scope = rule.scope();
        if coordinate.resource_at(scope).as_ref() != Some(&rule.resource) {
            continue;
        }
        resolved.at_mut(scope).push(rule);
    }
    resolved
}
