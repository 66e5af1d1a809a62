//! Permission rule records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::GuardResult;

use super::resource::{validate_shape, AccessLevel, Resource, Scope};
use super::types::{Action, ActionSet, Actor};

/// Identifier of a stored rule
pub type RuleId = String;

/// How a rule came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Granted by an administrator, participates in access evaluation
    #[default]
    Grant,
    /// Created by the lock coordinator only to carry lock state
    LockAnchor,
}

/// Kind of a lock history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Lock,
    Unlock,
}

/// One append-only lock history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub action: LockAction,
    pub by: String,
    pub at: DateTime<Utc>,
}

/// Uniqueness key: at most one enabled rule per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub actor: Actor,
    pub base: String,
    pub resource: Resource,
}

/// One authorization grant, plus the lock state of its resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: RuleId,
    pub actor: Actor,
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub resource: Resource,
    pub access_level: AccessLevel,
    /// Explicit action grants; when present they narrow the implied set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<ActionSet>,
    pub enabled: bool,
    #[serde(default)]
    pub kind: RuleKind,

    // --- Lock state ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<LockEntry>,

    // --- Descriptive metadata ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    // --- Versioning ---
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PermissionRule {
    /// Create a new enabled grant. The shape is validated.
    pub fn new(
        actor: Actor,
        base: impl Into<String>,
        resource: Resource,
        access_level: AccessLevel,
    ) -> GuardResult<Self> {
        validate_shape(&resource, &access_level)?;
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor,
            base: base.into(),
            site: None,
            resource,
            access_level,
            actions: None,
            enabled: true,
            kind: RuleKind::Grant,
            locked_by: None,
            locked_at: None,
            history: Vec::new(),
            name: None,
            note: None,
            created_by: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Minimal rule carrying lock state for a resource that had none.
    ///
    /// The level is the most permissive for the scope but the rule never
    /// participates in evaluation.
    pub fn lock_anchor(
        user_id: impl Into<String>,
        base: impl Into<String>,
        site: Option<String>,
        resource: Resource,
    ) -> GuardResult<Self> {
        let level = anchor_level(resource.scope());
        let user_id = user_id.into();
        let mut rule = Self::new(Actor::user(user_id.clone()), base, resource, level)?;
        rule.site = site;
        rule.kind = RuleKind::LockAnchor;
        rule.created_by = Some(user_id);
        Ok(rule)
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn with_actions(mut self, actions: ActionSet) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_created_by(mut self, user_id: impl Into<String>) -> Self {
        self.created_by = Some(user_id.into());
        self
    }

    pub fn scope(&self) -> Scope {
        self.resource.scope()
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            actor: self.actor.clone(),
            base: self.base.clone(),
            resource: self.resource.clone(),
        }
    }

    pub fn validate(&self) -> GuardResult<()> {
        validate_shape(&self.resource, &self.access_level)
    }

    /// Whether this rule takes part in access evaluation
    pub fn is_effective(&self) -> bool {
        self.enabled && self.kind == RuleKind::Grant
    }

    /// Implied actions of the level, narrowed by explicit actions if any
    pub fn effective_actions(&self) -> ActionSet {
        let implied = self.access_level.implied_actions();
        match &self.actions {
            Some(explicit) => implied.intersection(explicit),
            None => implied,
        }
    }

    pub fn allows(&self, action: Action) -> bool {
        self.effective_actions().contains(action)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_locked_by_other(&self, user_id: &str) -> bool {
        matches!(&self.locked_by, Some(holder) if holder != user_id)
    }

    /// Bump version and timestamp after a mutation
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub(crate) fn record_lock(&mut self, user_id: &str, at: DateTime<Utc>) {
        self.locked_by = Some(user_id.to_string());
        self.locked_at = Some(at);
        self.history.push(LockEntry {
            action: LockAction::Lock,
            by: user_id.to_string(),
            at,
        });
        self.touch();
    }

    pub(crate) fn record_unlock(&mut self, by: &str, at: DateTime<Utc>) {
        self.locked_by = None;
        self.locked_at = None;
        self.history.push(LockEntry {
            action: LockAction::Unlock,
            by: by.to_string(),
            at,
        });
        self.touch();
    }
}

fn anchor_level(scope: Scope) -> AccessLevel {
    use super::resource::{CellAccess, ColumnAccess, RowAccess, TableAccess};
    match scope {
        Scope::Table => AccessLevel::Table(TableAccess::Full),
        Scope::Column => AccessLevel::Column(ColumnAccess::Visible),
        Scope::Row => AccessLevel::Row(RowAccess::Full),
        Scope::Cell => AccessLevel::Cell(CellAccess::Editable),
    }
}
