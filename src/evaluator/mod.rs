//! Effective-Access Evaluator
//!
//! Turns resolved candidate rules plus the caller's identity into one
//! decision:
//!
//! 1. Super-administrators are allowed everything.
//! 2. Scopes are walked cell → row → column → table. At each scope a rule for
//!    the exact user wins over role rules, which win over all-members rules.
//!    The first scope with any match decides.
//! 3. The matched rule's access level implies an action set, narrowed by its
//!    explicit actions if present.
//! 4. With no match anywhere the role-default matrix decides.
//!
//! The lock veto is applied afterwards by the guard; see [`crate::locks`].

mod decision;

pub use decision::{Decision, DecisionSource, DenyReason, Evaluation};

use crate::config::{GuardConfig, RoleCombination, RoleDefaults};
use crate::core::Identity;
use crate::resolver::{ResolvedScopes, ScopeCandidates};
use crate::rules::{Action, ActionSet, Actor, PermissionRule, Role, Scope};

/// Pure decision logic, configured once per process
#[derive(Debug, Clone)]
pub struct EffectiveAccessEvaluator {
    role_defaults: RoleDefaults,
    combination: RoleCombination,
    owners_bypass_rules: bool,
}

impl Default for EffectiveAccessEvaluator {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

impl EffectiveAccessEvaluator {
    pub fn new(role_defaults: RoleDefaults, combination: RoleCombination) -> Self {
        Self {
            role_defaults,
            combination,
            owners_bypass_rules: false,
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            role_defaults: config.role_defaults.clone(),
            combination: config.role_combination,
            owners_bypass_rules: config.owners_bypass_rules,
        }
    }

    pub fn with_owners_bypass(mut self, enabled: bool) -> Self {
        self.owners_bypass_rules = enabled;
        self
    }

    pub fn role_defaults(&self) -> &RoleDefaults {
        &self.role_defaults
    }

    /// Decide whether `identity` may perform `action` given the resolved rules
    pub fn evaluate(
        &self,
        identity: &Identity,
        resolved: &ResolvedScopes,
        action: Action,
    ) -> Evaluation {
        if identity.is_super_admin() {
            return Evaluation::new(Decision::Allow, DecisionSource::SuperAdmin);
        }

        if self.owners_bypass_rules && identity.roles().contains(&Role::Owner) {
            let decision = decide(self.role_defaults.owner.contains(action), None);
            return Evaluation::new(decision, DecisionSource::OwnerBypass);
        }

        for scope in Scope::PRECEDENCE {
            if let Some(rule) = self.select(identity, scope, resolved.at(scope)) {
                let allowed = rule.allows(action);
                let decision = decide(allowed, Some(rule));
                tracing::debug!(
                    rule_id = %rule.id,
                    scope = %scope,
                    actor = %rule.actor,
                    action = %action,
                    decision = %decision,
                    "rule decided"
                );
                return Evaluation::new(
                    decision,
                    DecisionSource::Rule {
                        rule_id: rule.id.clone(),
                        scope,
                        actor: rule.actor.clone(),
                    },
                );
            }
        }

        let defaults = self.default_actions(&identity.roles());
        let decision = decide(defaults.contains(action), None);
        tracing::debug!(
            action = %action,
            decision = %decision,
            "no rule matched, role defaults decided"
        );
        Evaluation::new(decision, DecisionSource::RoleDefault)
    }

    /// The rule that applies to this identity at one scope, if any
    fn select<'a>(
        &self,
        identity: &Identity,
        scope: Scope,
        candidates: &'a ScopeCandidates,
    ) -> Option<&'a PermissionRule> {
        let own: Vec<&PermissionRule> = candidates
            .users
            .iter()
            .filter(|r| r.actor.is_user(&identity.user_id))
            .collect();
        if let Some(rule) = latest(own, scope) {
            return Some(rule);
        }

        let roles = identity.roles();
        let mut per_role: Vec<&PermissionRule> = Vec::new();
        for role in &roles {
            let matching: Vec<&PermissionRule> = candidates
                .roles
                .iter()
                .filter(|r| matches!(r.actor, Actor::Role { role: ref held } if held == role))
                .collect();
            if let Some(rule) = latest(matching, scope) {
                per_role.push(rule);
            }
        }
        if let Some(rule) = self.combine(per_role) {
            return Some(rule);
        }

        latest(candidates.members.iter().collect(), scope)
    }

    /// Pick among rules granted to different roles of the same user
    fn combine<'a>(&self, rules: Vec<&'a PermissionRule>) -> Option<&'a PermissionRule> {
        let rank = |r: &PermissionRule| {
            (
                r.access_level.permissiveness(),
                r.effective_actions().len(),
            )
        };
        rules.into_iter().reduce(|best, candidate| {
            let ordering = rank(candidate).cmp(&rank(best));
            let better = match self.combination {
                RoleCombination::MostPermissive => ordering.is_gt(),
                RoleCombination::MostRestrictive => ordering.is_lt(),
            };
            if better || (ordering.is_eq() && candidate.updated_at > best.updated_at) {
                candidate
            } else {
                best
            }
        })
    }

    /// Role-default actions for every role the identity holds
    pub fn default_actions(&self, roles: &[Role]) -> ActionSet {
        let mut sets = roles.iter().map(|r| self.role_defaults.for_role(*r).clone());
        let Some(first) = sets.next() else {
            return ActionSet::empty();
        };
        match self.combination {
            RoleCombination::MostPermissive => sets.fold(first, |acc, s| acc.union(&s)),
            RoleCombination::MostRestrictive => sets.fold(first, |acc, s| acc.intersection(&s)),
        }
    }
}

fn decide(allowed: bool, rule: Option<&PermissionRule>) -> Decision {
    if allowed {
        return Decision::Allow;
    }
    match rule {
        Some(rule) if rule.access_level.is_hidden() => Decision::Deny(DenyReason::HiddenScope),
        Some(_) => Decision::Deny(DenyReason::ExplicitDeny),
        None => Decision::Deny(DenyReason::NoRuleRoleDefaultDeny),
    }
}

/// Most recently updated rule; more than one means the uniqueness invariant
/// was broken somewhere and is logged.
fn latest(rules: Vec<&PermissionRule>, scope: Scope) -> Option<&PermissionRule> {
    if rules.len() > 1 {
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        tracing::warn!(
            scope = %scope,
            actor = %rules[0].actor,
            rule_ids = ?ids,
            "consistency anomaly: several enabled rules for one actor and resource"
        );
    }
    rules
        .into_iter()
        .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
}
