//! Process-local rule store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::GuardResult;
use crate::rules::{PermissionRule, Resource};

use super::table::RuleTable;
use super::{LockAcquisition, LockRelease, LockTarget, RuleFilter, RuleStore};

/// Rule store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    table: RwLock<RuleTable>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing rules; shapes are validated
    pub fn with_rules(rules: Vec<PermissionRule>) -> GuardResult<Self> {
        Ok(Self {
            table: RwLock::new(RuleTable::from_rules(rules)?),
        })
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self, id: &str) -> GuardResult<Option<PermissionRule>> {
        Ok(self.table.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &RuleFilter) -> GuardResult<Vec<PermissionRule>> {
        Ok(self.table.read().await.list(filter))
    }

    async fn rules_for(
        &self,
        base: &str,
        resources: &[Resource],
    ) -> GuardResult<Vec<PermissionRule>> {
        Ok(self.table.read().await.rules_for(base, resources))
    }

    async fn insert_unique(&self, rule: PermissionRule) -> GuardResult<PermissionRule> {
        self.table.write().await.insert_unique(rule)
    }

    async fn compare_and_swap(
        &self,
        rule: PermissionRule,
        expected_version: u64,
    ) -> GuardResult<PermissionRule> {
        self.table.write().await.compare_and_swap(rule, expected_version)
    }

    async fn try_acquire_lock(
        &self,
        target: &LockTarget,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> GuardResult<LockAcquisition> {
        self.table.write().await.try_acquire_lock(target, user_id, at)
    }

    async fn release_lock(
        &self,
        base: &str,
        resource: &Resource,
        user_id: &str,
        force: bool,
        at: DateTime<Utc>,
    ) -> GuardResult<LockRelease> {
        Ok(self
            .table
            .write()
            .await
            .release_lock(base, resource, user_id, force, at))
    }

    async fn purge(&self, id: &str) -> GuardResult<Option<PermissionRule>> {
        Ok(self.table.write().await.purge(id))
    }
}
