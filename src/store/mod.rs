//! Rule Store
//!
//! The only shared mutable state in the engine. Every backend implements the
//! same atomic primitives, each applied inside one critical section:
//!
//! - `insert_unique` - insert unless another enabled rule holds the same key
//! - `compare_and_swap` - full-rule replace guarded by the `version` token
//! - `try_acquire_lock` - conditional write, succeeds only if nobody else holds
//!   a lock on the resource
//! - `release_lock` - holder (or forced) release
//!
//! Lock acquisition races are decided here and nowhere else, so a store shared
//! by several processes stays correct as long as its backend serializes these
//! primitives.

mod file;
mod memory;
mod table;

pub use file::{AuditEvent, AuditKind, FileRuleStore};
pub use memory::MemoryRuleStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::core::GuardResult;
use crate::rules::{PermissionRule, Resource, Scope};

/// Listing filter for [`RuleStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub base: String,
    pub scope: Option<Scope>,
    pub resource: Option<Resource>,
    pub site: Option<String>,
    pub enabled_only: bool,
}

impl RuleFilter {
    pub fn base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn enabled_only(mut self) -> Self {
        self.enabled_only = true;
        self
    }

    pub fn matches(&self, rule: &PermissionRule) -> bool {
        rule.base == self.base
            && self.scope.map_or(true, |s| rule.scope() == s)
            && self.resource.as_ref().map_or(true, |r| &rule.resource == r)
            && self
                .site
                .as_ref()
                .map_or(true, |s| rule.site.as_deref() == Some(s.as_str()))
            && (!self.enabled_only || rule.enabled)
    }
}

/// Where a lock should live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTarget {
    pub base: String,
    pub site: Option<String>,
    pub resource: Resource,
}

impl LockTarget {
    pub fn new(base: impl Into<String>, resource: Resource) -> Self {
        Self {
            base: base.into(),
            site: None,
            resource,
        }
    }

    pub fn with_site(mut self, site: Option<String>) -> Self {
        self.site = site;
        self
    }
}

/// Outcome of the conditional lock write
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    /// Lock taken now; `anchored` when a lock anchor rule had to be created
    Acquired { rule: PermissionRule, anchored: bool },
    /// The requester already held it; nothing changed
    AlreadyHeld { rule: PermissionRule },
    /// Someone else holds it; nothing changed
    HeldByOther { holder: String },
}

/// Outcome of a release
#[derive(Debug, Clone, PartialEq)]
pub enum LockRelease {
    Released {
        rule: PermissionRule,
        previous_holder: String,
    },
    /// Nothing was locked; nothing changed
    NotLocked,
    /// Held by someone else and the release was not forced
    HeldByOther { holder: String },
}

/// Durable collection of permission rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Fetch one rule
    async fn get(&self, id: &str) -> GuardResult<Option<PermissionRule>>;

    /// All rules matching the filter, oldest first
    async fn list(&self, filter: &RuleFilter) -> GuardResult<Vec<PermissionRule>>;

    /// Every rule in `base` whose resource is exactly one of `resources`,
    /// regardless of enabled flag or kind
    async fn rules_for(&self, base: &str, resources: &[Resource])
        -> GuardResult<Vec<PermissionRule>>;

    /// Insert, failing with `DuplicateRule` if an enabled rule holds the key
    async fn insert_unique(&self, rule: PermissionRule) -> GuardResult<PermissionRule>;

    /// Replace the grant fields of a rule if its version still equals
    /// `expected_version`. Lock state and history are never taken from the
    /// incoming value.
    async fn compare_and_swap(
        &self,
        rule: PermissionRule,
        expected_version: u64,
    ) -> GuardResult<PermissionRule>;

    /// Take the lock on a resource unless another user holds it
    async fn try_acquire_lock(
        &self,
        target: &LockTarget,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> GuardResult<LockAcquisition>;

    /// Release the lock on a resource. Only the holder may release unless
    /// `force` is set.
    async fn release_lock(
        &self,
        base: &str,
        resource: &Resource,
        user_id: &str,
        force: bool,
        at: DateTime<Utc>,
    ) -> GuardResult<LockRelease>;

    /// Hard-delete a rule
    async fn purge(&self, id: &str) -> GuardResult<Option<PermissionRule>>;
}

/// Open the backend named by the config
pub fn open_store(config: &StoreConfig) -> GuardResult<Arc<dyn RuleStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryRuleStore::new())),
        StoreConfig::File { dir } => Ok(Arc::new(FileRuleStore::open(dir)?)),
    }
}
