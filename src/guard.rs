//! Permission guard
//!
//! The one entry point the request handlers call. A guard owns a store handle
//! plus the evaluator, lock coordinator and admin API built over it, and
//! bounds every store call with the configured timeout.
//!
//! ## Check path
//!
//! ```text
//! can_perform ──► rules_for (one read, timed)
//!                   ├─► partition ──► evaluator ──► Deny? return
//!                   └─► lock veto ─────────────────► LOCKED_BY_OTHER?
//! ```
//!
//! A store error or timeout on this path is a `Deny(STORE_UNAVAILABLE)`,
//! never an `Allow`.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;

use crate::admin::{GrantRequest, PermissionAdmin};
use crate::config::GuardConfig;
use crate::core::{ErrorCode, GuardError, GuardResult, Identity};
use crate::evaluator::{
    Decision, DecisionSource, DenyReason, EffectiveAccessEvaluator, Evaluation,
};
use crate::locks::{self, LockCoordinator};
use crate::resolver::{partition, Coordinate, ScopeResolver};
use crate::rules::{AccessLevel, Action, ActionSet, PermissionRule, RuleId};
use crate::store::{open_store, RuleFilter, RuleStore};

/// Facade over the whole engine
#[derive(Clone)]
pub struct PermissionGuard {
    config: GuardConfig,
    store: Arc<dyn RuleStore>,
    resolver: ScopeResolver,
    evaluator: EffectiveAccessEvaluator,
    locks: LockCoordinator,
    admin: PermissionAdmin,
}

impl PermissionGuard {
    /// Open the configured store and build a guard over it
    pub fn new(config: GuardConfig) -> GuardResult<Self> {
        config.validate()?;
        let store = open_store(&config.store)?;
        Ok(Self::with_store(config, store))
    }

    /// Build a guard over an already opened store
    pub fn with_store(config: GuardConfig, store: Arc<dyn RuleStore>) -> Self {
        tracing::info!(
            "[PermissionGuard] Ready (timeout {}ms, {:?})",
            config.store_timeout_ms,
            config.role_combination
        );
        Self {
            resolver: ScopeResolver::new(store.clone()),
            evaluator: EffectiveAccessEvaluator::from_config(&config),
            locks: LockCoordinator::new(store.clone()),
            admin: PermissionAdmin::new(store.clone()).with_retry_limit(config.grant_retry_limit),
            store,
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    pub fn admin(&self) -> &PermissionAdmin {
        &self.admin
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = GuardResult<T>>,
    ) -> GuardResult<T> {
        match tokio::time::timeout(self.config.store_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::unavailable(format!(
                "{} timed out after {}ms",
                operation, self.config.store_timeout_ms
            ))),
        }
    }

    // ========================================================================
    // Checks
    // ========================================================================

    /// May `identity` perform `action` at `coordinate`?
    pub async fn can_perform(
        &self,
        identity: &Identity,
        base: &str,
        coordinate: &Coordinate,
        action: Action,
    ) -> Decision {
        self.evaluate(identity, base, coordinate, action)
            .await
            .decision
    }

    /// [`can_perform`](Self::can_perform) with the rule or default that decided
    pub async fn evaluate(
        &self,
        identity: &Identity,
        base: &str,
        coordinate: &Coordinate,
        action: Action,
    ) -> Evaluation {
        // The identity's role only speaks for its own base
        if identity.base_id != base && !identity.is_super_admin() {
            tracing::warn!(
                user = %identity.user_id,
                identity_base = %identity.base_id,
                base = %base,
                "identity belongs to another base, denying"
            );
            return Evaluation::new(
                Decision::Deny(DenyReason::NoRuleRoleDefaultDeny),
                DecisionSource::RoleDefault,
            );
        }

        let rules = match self
            .timed("rules_for", self.resolver.fetch(base, coordinate))
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(
                    user = %identity.user_id,
                    base = %base,
                    coordinate = %coordinate,
                    error = %e,
                    "rule store unavailable, denying"
                );
                return Evaluation::store_unavailable();
            }
        };

        let holder = locks::veto(&rules, base, coordinate, &identity.user_id, action)
            .map(str::to_string);
        let resolved = partition(base, coordinate, rules);
        let evaluation = self.evaluator.evaluate(identity, &resolved, action);

        match holder {
            Some(holder) if evaluation.is_allowed() => {
                tracing::debug!(
                    user = %identity.user_id,
                    holder = %holder,
                    coordinate = %coordinate,
                    action = %action,
                    "lock veto"
                );
                Evaluation::locked_by(holder)
            }
            _ => evaluation,
        }
    }

    /// Columns of `table` the identity may read, in input order
    pub async fn visible_columns(
        &self,
        identity: &Identity,
        base: &str,
        table: &str,
        columns: &[String],
    ) -> Vec<String> {
        let checks = columns.iter().map(|column| {
            let coordinate = Coordinate::column(table, column);
            async move { self.can_perform(identity, base, &coordinate, Action::Read).await }
        });
        let decisions = join_all(checks).await;
        columns
            .iter()
            .zip(decisions)
            .filter(|(_, decision)| decision.is_allowed())
            .map(|(column, _)| column.clone())
            .collect()
    }

    /// Rows of `table` the identity may read, in input order
    pub async fn visible_rows(
        &self,
        identity: &Identity,
        base: &str,
        table: &str,
        rows: &[String],
    ) -> Vec<String> {
        let checks = rows.iter().map(|row| {
            let coordinate = Coordinate::row(table, row);
            async move { self.can_perform(identity, base, &coordinate, Action::Read).await }
        });
        let decisions = join_all(checks).await;
        rows.iter()
            .zip(decisions)
            .filter(|(_, decision)| decision.is_allowed())
            .map(|(row, _)| row.clone())
            .collect()
    }

    // ========================================================================
    // Locks
    // ========================================================================

    /// Check the `lock` action, then take the lock on the coordinate's cell
    /// (or row). Fails only for a coordinate that names neither.
    pub async fn acquire_lock(
        &self,
        identity: &Identity,
        base: &str,
        coordinate: &Coordinate,
    ) -> GuardResult<Decision> {
        let resource = locks::lock_resource(coordinate)?;

        let evaluation = self.evaluate(identity, base, coordinate, Action::Lock).await;
        if !evaluation.is_allowed() {
            return Ok(evaluation.decision);
        }

        match self
            .timed(
                "try_acquire_lock",
                self.locks.acquire(identity, base, &resource),
            )
            .await
        {
            Ok(decision) => Ok(decision),
            Err(e) if e.code() == ErrorCode::StoreUnavailable => {
                tracing::error!(
                    user = %identity.user_id,
                    resource = %resource,
                    error = %e,
                    "rule store unavailable during lock acquisition"
                );
                Ok(Decision::Deny(DenyReason::StoreUnavailable))
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lock held by `identity`
    pub async fn release_lock(
        &self,
        identity: &Identity,
        base: &str,
        coordinate: &Coordinate,
    ) -> GuardResult<()> {
        let resource = locks::lock_resource(coordinate)?;
        self.timed("release_lock", self.locks.release(identity, base, &resource))
            .await
    }

    /// Release whoever holds the lock; owners, admins and super-admins only
    pub async fn force_release_lock(
        &self,
        admin: &Identity,
        base: &str,
        coordinate: &Coordinate,
    ) -> GuardResult<Option<String>> {
        let resource = locks::lock_resource(coordinate)?;
        self.timed(
            "force_release_lock",
            self.locks.force_release(admin, base, &resource),
        )
        .await
    }

    // ========================================================================
    // Administration
    // ========================================================================

    pub async fn grant(&self, request: GrantRequest) -> GuardResult<RuleId> {
        self.timed("grant", self.admin.grant(request)).await
    }

    pub async fn revoke(&self, id: &str) -> GuardResult<PermissionRule> {
        self.timed("revoke", self.admin.revoke(id)).await
    }

    pub async fn enable(&self, id: &str) -> GuardResult<PermissionRule> {
        self.timed("enable", self.admin.enable(id)).await
    }

    pub async fn set_access_level(
        &self,
        id: &str,
        level: AccessLevel,
    ) -> GuardResult<PermissionRule> {
        self.timed("set_access_level", self.admin.set_access_level(id, level))
            .await
    }

    pub async fn set_actions(
        &self,
        id: &str,
        actions: Option<ActionSet>,
    ) -> GuardResult<PermissionRule> {
        self.timed("set_actions", self.admin.set_actions(id, actions))
            .await
    }

    pub async fn purge(&self, identity: &Identity, id: &str) -> GuardResult<PermissionRule> {
        self.timed("purge", self.admin.purge(identity, id)).await
    }

    pub async fn get_rule(&self, id: &str) -> GuardResult<PermissionRule> {
        self.timed("get_rule", self.admin.get_rule(id)).await
    }

    pub async fn list_rules(&self, filter: &RuleFilter) -> GuardResult<Vec<PermissionRule>> {
        self.timed("list_rules", self.admin.list_rules(filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::rules::{Actor, CellAccess, ColumnAccess, Resource, Role, RowAccess, TableAccess};
    use crate::store::{LockAcquisition, LockRelease, LockTarget, MemoryRuleStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn guard() -> PermissionGuard {
        PermissionGuard::new(GuardConfig::default()).unwrap()
    }

    fn member(user: &str) -> Identity {
        Identity::new(user, Role::Member, "b1")
    }

    /// Guard where members may lock anything in t1
    async fn editable_guard() -> PermissionGuard {
        let guard = guard();
        guard
            .grant(GrantRequest::new(
                Actor::role(Role::Member),
                "b1",
                Resource::table("t1"),
                AccessLevel::Table(TableAccess::ReadWrite),
            ))
            .await
            .unwrap();
        guard
    }

    /// Store that answers every read and lock call after `delay`, or fails
    struct SlowStore {
        inner: MemoryRuleStore,
        delay: Duration,
        fail: bool,
    }

    impl SlowStore {
        async fn pause(&self) -> GuardResult<()> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(GuardError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk gone",
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RuleStore for SlowStore {
        async fn get(&self, id: &str) -> GuardResult<Option<PermissionRule>> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &RuleFilter) -> GuardResult<Vec<PermissionRule>> {
            self.inner.list(filter).await
        }

        async fn rules_for(
            &self,
            base: &str,
            resources: &[Resource],
        ) -> GuardResult<Vec<PermissionRule>> {
            self.pause().await?;
            self.inner.rules_for(base, resources).await
        }

        async fn insert_unique(&self, rule: PermissionRule) -> GuardResult<PermissionRule> {
            self.inner.insert_unique(rule).await
        }

        async fn compare_and_swap(
            &self,
            rule: PermissionRule,
            expected_version: u64,
        ) -> GuardResult<PermissionRule> {
            self.inner.compare_and_swap(rule, expected_version).await
        }

        async fn try_acquire_lock(
            &self,
            target: &LockTarget,
            user_id: &str,
            at: DateTime<Utc>,
        ) -> GuardResult<LockAcquisition> {
            self.pause().await?;
            self.inner.try_acquire_lock(target, user_id, at).await
        }

        async fn release_lock(
            &self,
            base: &str,
            resource: &Resource,
            user_id: &str,
            force: bool,
            at: DateTime<Utc>,
        ) -> GuardResult<LockRelease> {
            self.inner
                .release_lock(base, resource, user_id, force, at)
                .await
        }

        async fn purge(&self, id: &str) -> GuardResult<Option<PermissionRule>> {
            self.inner.purge(id).await
        }
    }

    #[tokio::test]
    async fn test_can_perform_end_to_end() {
        let guard = guard();
        let cell = Coordinate::cell("t1", "r1", "c1");

        assert!(guard
            .can_perform(&member("u1"), "b1", &cell, Action::Update)
            .await
            .is_allowed());

        guard
            .grant(GrantRequest::new(
                Actor::role(Role::Member),
                "b1",
                Resource::table("t1"),
                AccessLevel::Table(TableAccess::ReadOnly),
            ))
            .await
            .unwrap();
        assert_eq!(
            guard
                .can_perform(&member("u1"), "b1", &cell, Action::Update)
                .await,
            Decision::Deny(DenyReason::ExplicitDeny)
        );

        let id = guard
            .grant(GrantRequest::new(
                Actor::user("u1"),
                "b1",
                Resource::cell("t1", "r1", "c1"),
                AccessLevel::Cell(CellAccess::Editable),
            ))
            .await
            .unwrap();
        let evaluation = guard
            .evaluate(&member("u1"), "b1", &cell, Action::Update)
            .await;
        assert!(evaluation.is_allowed());
        assert_eq!(evaluation.rule_id(), Some(id.as_str()));

        // revocation takes effect on the next check
        guard.revoke(&id).await.unwrap();
        assert!(!guard
            .can_perform(&member("u1"), "b1", &cell, Action::Update)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_lock_veto() {
        let guard = editable_guard().await;
        let row = Coordinate::row("t1", "r1");
        let cell = Coordinate::cell("t1", "r1", "c1");

        assert_eq!(
            guard.acquire_lock(&member("u1"), "b1", &row).await.unwrap(),
            Decision::Allow
        );

        for action in [Action::Update, Action::Delete, Action::Lock, Action::Hide] {
            let decision = guard.can_perform(&member("u2"), "b1", &cell, action).await;
            assert_eq!(decision, Decision::Deny(DenyReason::LockedByOther));
        }
        assert!(guard
            .can_perform(&member("u2"), "b1", &cell, Action::Read)
            .await
            .is_allowed());
        assert!(guard
            .can_perform(&member("u1"), "b1", &cell, Action::Update)
            .await
            .is_allowed());

        // a cell under another user's row lock cannot be locked
        assert_eq!(
            guard.acquire_lock(&member("u2"), "b1", &cell).await.unwrap(),
            Decision::Deny(DenyReason::LockedByOther)
        );

        guard.release_lock(&member("u1"), "b1", &row).await.unwrap();
        assert!(guard
            .can_perform(&member("u2"), "b1", &cell, Action::Update)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_identity_for_other_base_is_denied() {
        let guard = guard();
        guard
            .grant(GrantRequest::new(
                Actor::AllMembers,
                "b2",
                Resource::table("t1"),
                AccessLevel::Table(TableAccess::ReadWrite),
            ))
            .await
            .unwrap();
        let table = Coordinate::table("t1");

        assert_eq!(
            guard
                .can_perform(&member("u1"), "b2", &table, Action::Read)
                .await,
            Decision::Deny(DenyReason::NoRuleRoleDefaultDeny)
        );
        assert!(guard
            .can_perform(&Identity::new("u1", Role::Member, "b2"), "b2", &table, Action::Read)
            .await
            .is_allowed());
        assert!(guard
            .can_perform(&member("root").as_super_admin(), "b2", &table, Action::Delete)
            .await
            .is_allowed());
        assert_eq!(
            guard
                .acquire_lock(&member("u1"), "b2", &Coordinate::row("t1", "r1"))
                .await
                .unwrap(),
            Decision::Deny(DenyReason::NoRuleRoleDefaultDeny)
        );
    }

    #[tokio::test]
    async fn test_row_lock_respects_cell_locks() {
        let guard = editable_guard().await;
        let row = Coordinate::row("t1", "r1");
        let cell = Coordinate::cell("t1", "r1", "c1");

        assert_eq!(
            guard.acquire_lock(&member("u1"), "b1", &cell).await.unwrap(),
            Decision::Allow
        );
        assert_eq!(
            guard.acquire_lock(&member("u2"), "b1", &row).await.unwrap(),
            Decision::Deny(DenyReason::LockedByOther)
        );

        // the cell holder keeps editing its cell
        assert!(guard
            .can_perform(&member("u1"), "b1", &cell, Action::Update)
            .await
            .is_allowed());
        assert_eq!(
            guard
                .can_perform(&member("u2"), "b1", &cell, Action::Update)
                .await,
            Decision::Deny(DenyReason::LockedByOther)
        );

        guard.release_lock(&member("u1"), "b1", &cell).await.unwrap();
        assert_eq!(
            guard.acquire_lock(&member("u2"), "b1", &row).await.unwrap(),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn test_acquire_requires_lock_grant() {
        let guard = guard();
        let row = Coordinate::row("t1", "r1");

        for identity in [member("u1"), Identity::new("g1", Role::Guest, "b1")] {
            assert_eq!(
                guard.acquire_lock(&identity, "b1", &row).await.unwrap(),
                Decision::Deny(DenyReason::NoRuleRoleDefaultDeny)
            );
        }
        assert!(guard
            .list_rules(&RuleFilter::base("b1"))
            .await
            .unwrap()
            .is_empty());

        let err = guard
            .acquire_lock(&member("u1"), "b1", &Coordinate::table("t1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScopeResourceShape);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_exclusivity_under_concurrency() {
        let guard = Arc::new(guard());
        let cell = Coordinate::cell("t1", "r1", "c1");

        let mut tasks = Vec::new();
        for i in 0..12 {
            let guard = guard.clone();
            let cell = cell.clone();
            tasks.push(tokio::spawn(async move {
                let user = Identity::new(format!("u{}", i), Role::Admin, "b1");
                guard.acquire_lock(&user, "b1", &cell).await.unwrap()
            }));
        }

        let mut allowed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Decision::Allow => allowed += 1,
                other => assert_eq!(other, Decision::Deny(DenyReason::LockedByOther)),
            }
        }
        assert_eq!(allowed, 1);

        let rules = guard.list_rules(&RuleFilter::base("b1")).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].history.len(), 1);
    }

    #[tokio::test]
    async fn test_force_release_lock() {
        let guard = editable_guard().await;
        let cell = Coordinate::cell("t1", "r1", "c1");
        guard.acquire_lock(&member("u1"), "b1", &cell).await.unwrap();

        let err = guard
            .release_lock(&member("u2"), "b1", &cell)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockNotHeld);

        let owner = Identity::new("o1", Role::Owner, "b1");
        let previous = guard
            .force_release_lock(&owner, "b1", &cell)
            .await
            .unwrap();
        assert_eq!(previous.as_deref(), Some("u1"));
        assert!(guard
            .acquire_lock(&member("u2"), "b1", &cell)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_visible_columns_and_rows() {
        let guard = guard();
        guard
            .grant(GrantRequest::new(
                Actor::role(Role::Guest),
                "b1",
                Resource::column("t1", "salary"),
                AccessLevel::Column(ColumnAccess::Hidden),
            ))
            .await
            .unwrap();
        guard
            .grant(GrantRequest::new(
                Actor::AllMembers,
                "b1",
                Resource::row("t1", "r2"),
                AccessLevel::Row(RowAccess::Hidden),
            ))
            .await
            .unwrap();

        let columns: Vec<String> = ["name", "salary", "team"].iter().map(|s| s.to_string()).collect();
        let guest = Identity::new("g1", Role::Guest, "b1");
        assert_eq!(
            guard.visible_columns(&guest, "b1", "t1", &columns).await,
            vec!["name".to_string(), "team".to_string()]
        );
        assert_eq!(
            guard
                .visible_columns(&member("u1"), "b1", "t1", &columns)
                .await,
            columns
        );

        let rows: Vec<String> = ["r1", "r2", "r3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            guard.visible_rows(&member("u1"), "b1", "t1", &rows).await,
            vec!["r1".to_string(), "r3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_slow_store_denies_with_store_unavailable() {
        let store = Arc::new(SlowStore {
            inner: MemoryRuleStore::new(),
            delay: Duration::from_millis(200),
            fail: false,
        });
        let guard = PermissionGuard::with_store(GuardConfig::default().with_store_timeout(20), store);
        let cell = Coordinate::cell("t1", "r1", "c1");

        let owner = Identity::new("o1", Role::Owner, "b1");
        assert_eq!(
            guard.can_perform(&owner, "b1", &cell, Action::Read).await,
            Decision::Deny(DenyReason::StoreUnavailable)
        );
        assert_eq!(
            guard.acquire_lock(&owner, "b1", &cell).await.unwrap(),
            Decision::Deny(DenyReason::StoreUnavailable)
        );
    }

    #[tokio::test]
    async fn test_failing_store_denies_with_store_unavailable() {
        let store = Arc::new(SlowStore {
            inner: MemoryRuleStore::new(),
            delay: Duration::ZERO,
            fail: true,
        });
        let guard = PermissionGuard::with_store(GuardConfig::default(), store);

        let root = Identity::new("root", Role::Owner, "b1").as_super_admin();
        let evaluation = guard
            .evaluate(&root, "b1", &Coordinate::table("t1"), Action::Read)
            .await;
        assert_eq!(evaluation, Evaluation::store_unavailable());
    }

    #[tokio::test]
    async fn test_file_backed_guard() {
        let temp = TempDir::new().unwrap();
        let config = GuardConfig::default().with_store(StoreConfig::File {
            dir: temp.path().to_path_buf(),
        });

        let guard = PermissionGuard::new(config.clone()).unwrap();
        guard
            .grant(GrantRequest::new(
                Actor::user("u1"),
                "b1",
                Resource::row("t1", "r1"),
                AccessLevel::Row(RowAccess::Hidden),
            ))
            .await
            .unwrap();
        drop(guard);

        let reopened = PermissionGuard::new(config).unwrap();
        assert_eq!(
            reopened
                .can_perform(&member("u1"), "b1", &Coordinate::row("t1", "r1"), Action::Read)
                .await,
            Decision::Deny(DenyReason::HiddenScope)
        );
    }
}
