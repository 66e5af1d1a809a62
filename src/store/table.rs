//! In-memory rule table shared by all store backends
//!
//! Callers hold the backend's write lock around every mutating method, which
//! makes each method one atomic step.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::core::{GuardError, GuardResult};
use crate::rules::{PermissionRule, Resource, RuleId};

use super::{LockAcquisition, LockRelease, LockTarget, RuleFilter};

#[derive(Debug, Clone, Default)]
pub(crate) struct RuleTable {
    rules: HashMap<RuleId, PermissionRule>,
}

impl RuleTable {
    /// Build from persisted rules, validating every shape
    pub fn from_rules(rules: Vec<PermissionRule>) -> GuardResult<Self> {
        let mut table = Self::default();
        for rule in rules {
            rule.validate()?;
            if table.rules.contains_key(&rule.id) {
                return Err(GuardError::unavailable(format!(
                    "rule id {} appears twice in the snapshot",
                    rule.id
                )));
            }
            table.rules.insert(rule.id.clone(), rule);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn get(&self, id: &str) -> Option<&PermissionRule> {
        self.rules.get(id)
    }

    /// Rules in stable order: oldest first, id as tie-break
    pub fn snapshot(&self) -> Vec<PermissionRule> {
        let mut rules: Vec<PermissionRule> = self.rules.values().cloned().collect();
        sort_rules(&mut rules);
        rules
    }

    pub fn list(&self, filter: &RuleFilter) -> Vec<PermissionRule> {
        let mut rules: Vec<PermissionRule> = self
            .rules
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_rules(&mut rules);
        rules
    }

    pub fn rules_for(&self, base: &str, resources: &[Resource]) -> Vec<PermissionRule> {
        let mut rules: Vec<PermissionRule> = self
            .rules
            .values()
            .filter(|r| r.base == base && resources.contains(&r.resource))
            .cloned()
            .collect();
        sort_rules(&mut rules);
        rules
    }

    /// Another enabled rule holding the same key as `rule`
    fn enabled_conflict(&self, rule: &PermissionRule) -> Option<&PermissionRule> {
        if !rule.enabled {
            return None;
        }
        let key = rule.key();
        self.rules
            .values()
            .find(|other| other.id != rule.id && other.enabled && other.key() == key)
    }

    pub fn insert_unique(&mut self, rule: PermissionRule) -> GuardResult<PermissionRule> {
        rule.validate()?;
        if self.rules.contains_key(&rule.id) {
            return Err(GuardError::DuplicateRule {
                existing: rule.id.clone(),
            });
        }
        if let Some(existing) = self.enabled_conflict(&rule) {
            return Err(GuardError::DuplicateRule {
                existing: existing.id.clone(),
            });
        }
        self.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    pub fn compare_and_swap(
        &mut self,
        mut rule: PermissionRule,
        expected_version: u64,
    ) -> GuardResult<PermissionRule> {
        rule.validate()?;
        let current = self
            .rules
            .get(&rule.id)
            .ok_or_else(|| GuardError::RuleNotFound(rule.id.clone()))?;

        if current.version != expected_version {
            return Err(GuardError::VersionConflict {
                id: rule.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        // Identity, lock state and history belong to the store
        rule.created_at = current.created_at;
        rule.locked_by = current.locked_by.clone();
        rule.locked_at = current.locked_at;
        rule.history = current.history.clone();
        rule.version = current.version;
        rule.touch();

        if let Some(existing) = self.enabled_conflict(&rule) {
            return Err(GuardError::DuplicateRule {
                existing: existing.id.clone(),
            });
        }

        self.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    /// Ids of the rules on one resource, in stable order
    fn resource_rule_ids(&self, base: &str, resource: &Resource) -> Vec<RuleId> {
        let mut rules: Vec<&PermissionRule> = self
            .rules
            .values()
            .filter(|r| r.base == base && &r.resource == resource)
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rules.into_iter().map(|r| r.id.clone()).collect()
    }

    /// Another user's lock that overlaps `resource` without being on it: the
    /// enclosing row for a cell, any cell inside the row for a row.
    fn overlapping_holder(&self, base: &str, resource: &Resource, user_id: &str) -> Option<String> {
        let overlaps = |other: &Resource| match (resource, other) {
            (Resource::Cell { table, row, .. }, Resource::Row { table: t, row: r })
            | (Resource::Row { table, row }, Resource::Cell { table: t, row: r, .. }) => {
                table == t && row == r
            }
            _ => false,
        };
        self.rules
            .values()
            .filter(|r| r.base == base && overlaps(&r.resource))
            .find(|r| r.is_locked_by_other(user_id))
            .and_then(|r| r.locked_by.clone())
    }

    pub fn try_acquire_lock(
        &mut self,
        target: &LockTarget,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> GuardResult<LockAcquisition> {
        let ids = self.resource_rule_ids(&target.base, &target.resource);

        if let Some(locked) = ids
            .iter()
            .filter_map(|id| self.rules.get(id))
            .find(|r| r.is_locked())
        {
            let holder = locked.locked_by.clone().unwrap_or_default();
            if holder == user_id {
                return Ok(LockAcquisition::AlreadyHeld {
                    rule: locked.clone(),
                });
            }
            return Ok(LockAcquisition::HeldByOther { holder });
        }

        if let Some(holder) = self.overlapping_holder(&target.base, &target.resource, user_id) {
            return Ok(LockAcquisition::HeldByOther { holder });
        }

        // Keep one carrier per resource so its history stays in one place
        let carrier = ids
            .iter()
            .find(|id| self.rules.get(*id).is_some_and(|r| !r.history.is_empty()))
            .or_else(|| {
                ids.iter()
                    .find(|id| self.rules.get(*id).is_some_and(|r| r.actor.is_user(user_id)))
            })
            .or_else(|| ids.first())
            .cloned();

        match carrier.and_then(|id| self.rules.get_mut(&id)) {
            Some(rule) => {
                rule.record_lock(user_id, at);
                Ok(LockAcquisition::Acquired {
                    rule: rule.clone(),
                    anchored: false,
                })
            }
            None => {
                let mut anchor = PermissionRule::lock_anchor(
                    user_id,
                    target.base.clone(),
                    target.site.clone(),
                    target.resource.clone(),
                )?;
                anchor.record_lock(user_id, at);
                self.rules.insert(anchor.id.clone(), anchor.clone());
                Ok(LockAcquisition::Acquired {
                    rule: anchor,
                    anchored: true,
                })
            }
        }
    }

    pub fn release_lock(
        &mut self,
        base: &str,
        resource: &Resource,
        user_id: &str,
        force: bool,
        at: DateTime<Utc>,
    ) -> LockRelease {
        let ids = self.resource_rule_ids(base, resource);
        let locked = ids
            .iter()
            .find(|id| self.rules.get(*id).is_some_and(|r| r.is_locked()))
            .cloned();

        let Some(rule) = locked.and_then(|id| self.rules.get_mut(&id)) else {
            return LockRelease::NotLocked;
        };

        let holder = rule.locked_by.clone().unwrap_or_default();
        if holder != user_id && !force {
            return LockRelease::HeldByOther { holder };
        }

        rule.record_unlock(user_id, at);
        LockRelease::Released {
            rule: rule.clone(),
            previous_holder: holder,
        }
    }

    pub fn purge(&mut self, id: &str) -> Option<PermissionRule> {
        self.rules.remove(id)
    }
}

fn sort_rules(rules: &mut [PermissionRule]) {
    rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
