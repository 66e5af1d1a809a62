//! Decision values

use serde::{Deserialize, Serialize};

use crate::rules::{Actor, RuleId, Scope};

/// Why an action was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// No rule at any scope and the role defaults do not include the action
    NoRuleRoleDefaultDeny,
    /// A matching rule exists and does not grant the action
    ExplicitDeny,
    /// A matching rule hides the resource
    HiddenScope,
    /// The row or cell is locked by another user
    LockedByOther,
    /// The rule store could not be consulted
    StoreUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NoRuleRoleDefaultDeny => "NO_RULE_ROLE_DEFAULT_DENY",
            DenyReason::ExplicitDeny => "EXPLICIT_DENY",
            DenyReason::HiddenScope => "HIDDEN_SCOPE",
            DenyReason::LockedByOther => "LOCKED_BY_OTHER",
            DenyReason::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }

    /// Error-taxonomy code the controller layer maps to a response
    pub fn taxonomy_code(&self) -> &'static str {
        match self {
            DenyReason::NoRuleRoleDefaultDeny => "DENY_NO_RULE",
            DenyReason::ExplicitDeny => "DENY_EXPLICIT",
            DenyReason::HiddenScope => "DENY_HIDDEN",
            DenyReason::LockedByOther => "DENY_LOCKED_BY_OTHER",
            DenyReason::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow or deny, with a machine-readable reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny(reason) => Some(*reason),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Deny(reason) => write!(f, "DENY({})", reason),
        }
    }
}

/// What produced a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionSource {
    SuperAdmin,
    OwnerBypass,
    Rule {
        rule_id: RuleId,
        scope: Scope,
        actor: Actor,
    },
    RoleDefault,
    LockVeto {
        holder: String,
    },
    StoreFailure,
}

/// A decision together with its provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub source: DecisionSource,
}

impl Evaluation {
    pub fn new(decision: Decision, source: DecisionSource) -> Self {
        Self { decision, source }
    }

    pub fn store_unavailable() -> Self {
        Self::new(
            Decision::Deny(DenyReason::StoreUnavailable),
            DecisionSource::StoreFailure,
        )
    }

    pub fn locked_by(holder: impl Into<String>) -> Self {
        Self::new(
            Decision::Deny(DenyReason::LockedByOther),
            DecisionSource::LockVeto {
                holder: holder.into(),
            },
        )
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    /// Id of the rule that decided, if a rule did
    pub fn rule_id(&self) -> Option<&str> {
        match &self.source {
            DecisionSource::Rule { rule_id, .. } => Some(rule_id),
            _ => None,
        }
    }
}
