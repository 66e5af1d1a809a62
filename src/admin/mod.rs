//! Permission Administration API
//!
//! Every mutation goes through the store's atomic primitives: grants are
//! `insert_unique` falling back to a compare-and-swap update of the rule that
//! already holds the key, and field edits are read-modify-CAS loops. Disabling
//! never deletes; only [`PermissionAdmin::purge`] removes a rule, and only for
//! a super-administrator.

use std::sync::Arc;

use crate::core::{GuardError, GuardResult, Identity};
use crate::rules::{AccessLevel, ActionSet, Actor, PermissionRule, Resource, RuleId, RuleKind};
use crate::store::{RuleFilter, RuleStore};

/// Default number of CAS retries before giving up
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Everything needed to create or update one grant
#[derive(Debug, Clone, PartialEq)]
pub struct GrantRequest {
    pub actor: Actor,
    pub base: String,
    pub resource: Resource,
    pub access_level: AccessLevel,
    pub actions: Option<ActionSet>,
    pub site: Option<String>,
    pub name: Option<String>,
    pub note: Option<String>,
    pub granted_by: Option<String>,
}

impl GrantRequest {
    pub fn new(
        actor: Actor,
        base: impl Into<String>,
        resource: Resource,
        access_level: AccessLevel,
    ) -> Self {
        Self {
            actor,
            base: base.into(),
            resource,
            access_level,
            actions: None,
            site: None,
            name: None,
            note: None,
            granted_by: None,
        }
    }

    pub fn with_actions(mut self, actions: ActionSet) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
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

    pub fn granted_by(mut self, user_id: impl Into<String>) -> Self {
        self.granted_by = Some(user_id.into());
        self
    }

    fn to_rule(&self) -> GuardResult<PermissionRule> {
        let mut rule = PermissionRule::new(
            self.actor.clone(),
            self.base.clone(),
            self.resource.clone(),
            self.access_level,
        )?;
        rule.actions = self.actions.clone();
        rule.site = self.site.clone();
        rule.name = self.name.clone();
        rule.note = self.note.clone();
        rule.created_by = self.granted_by.clone();
        Ok(rule)
    }

    /// Overlay this request onto the rule that already holds its key
    fn apply_to(&self, rule: &mut PermissionRule) {
        rule.access_level = self.access_level;
        rule.actions = self.actions.clone();
        rule.kind = RuleKind::Grant;
        if self.site.is_some() {
            rule.site = self.site.clone();
        }
        if self.name.is_some() {
            rule.name = self.name.clone();
        }
        if self.note.is_some() {
            rule.note = self.note.clone();
        }
        if rule.created_by.is_none() {
            rule.created_by = self.granted_by.clone();
        }
    }
}

/// Administrative operations over the rule store
#[derive(Clone)]
pub struct PermissionAdmin {
    store: Arc<dyn RuleStore>,
    retry_limit: u32,
}

impl PermissionAdmin {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Create a grant, or update the enabled rule that already holds the
    /// same (actor, base, resource) key.
    pub async fn grant(&self, request: GrantRequest) -> GuardResult<RuleId> {
        let rule = request.to_rule()?;
        let mut last_existing = rule.id.clone();

        for attempt in 0..=self.retry_limit {
            let existing = match self.store.insert_unique(rule.clone()).await {
                Ok(stored) => {
                    tracing::info!(
                        "[PermissionAdmin] Granted {} on {} to {} (rule {})",
                        stored.access_level,
                        stored.resource,
                        stored.actor,
                        stored.id
                    );
                    return Ok(stored.id);
                }
                Err(GuardError::DuplicateRule { existing }) => existing,
                Err(e) => return Err(e),
            };
            last_existing = existing.clone();

            let Some(current) = self.store.get(&existing).await? else {
                continue;
            };
            let mut updated = current.clone();
            request.apply_to(&mut updated);

            match self.store.compare_and_swap(updated, current.version).await {
                Ok(stored) => {
                    tracing::info!(
                        "[PermissionAdmin] Updated existing grant {} to {} on {}",
                        stored.id,
                        stored.access_level,
                        stored.resource
                    );
                    return Ok(stored.id);
                }
                Err(
                    GuardError::VersionConflict { .. }
                    | GuardError::RuleNotFound(_)
                    | GuardError::DuplicateRule { .. },
                ) => {
                    tracing::debug!(attempt, rule_id = %existing, "grant lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(GuardError::DuplicateRule {
            existing: last_existing,
        })
    }

    /// Disable a rule. It stays stored for audit.
    pub async fn revoke(&self, id: &str) -> GuardResult<PermissionRule> {
        let rule = self.modify(id, |rule| rule.enabled = false).await?;
        tracing::info!("[PermissionAdmin] Revoked rule {}", id);
        Ok(rule)
    }

    /// Re-enable a rule; fails with `DUPLICATE_RULE` if another enabled rule
    /// took its key meanwhile.
    pub async fn enable(&self, id: &str) -> GuardResult<PermissionRule> {
        let rule = self.modify(id, |rule| rule.enabled = true).await?;
        tracing::info!("[PermissionAdmin] Enabled rule {}", id);
        Ok(rule)
    }

    pub async fn set_access_level(
        &self,
        id: &str,
        level: AccessLevel,
    ) -> GuardResult<PermissionRule> {
        let rule = self
            .modify(id, |rule| rule.access_level = level)
            .await?;
        tracing::info!("[PermissionAdmin] Rule {} now {}", id, rule.access_level);
        Ok(rule)
    }

    /// Replace (or with `None`, clear) the explicit action set
    pub async fn set_actions(
        &self,
        id: &str,
        actions: Option<ActionSet>,
    ) -> GuardResult<PermissionRule> {
        let rule = self
            .modify(id, |rule| rule.actions = actions.clone())
            .await?;
        tracing::info!("[PermissionAdmin] Updated actions of rule {}", id);
        Ok(rule)
    }

    /// Hard-delete a rule. Super-administrators only.
    pub async fn purge(&self, identity: &Identity, id: &str) -> GuardResult<PermissionRule> {
        if !identity.is_super_admin() {
            return Err(GuardError::Forbidden(format!(
                "{} may not purge rules",
                identity.user_id
            )));
        }
        let removed = self
            .store
            .purge(id)
            .await?
            .ok_or_else(|| GuardError::RuleNotFound(id.to_string()))?;
        tracing::info!(
            "[PermissionAdmin] {} purged rule {}",
            identity.user_id,
            id
        );
        Ok(removed)
    }

    pub async fn get_rule(&self, id: &str) -> GuardResult<PermissionRule> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| GuardError::RuleNotFound(id.to_string()))
    }

    pub async fn list_rules(&self, filter: &RuleFilter) -> GuardResult<Vec<PermissionRule>> {
        self.store.list(filter).await
    }

    /// Read-modify-CAS, retried on version conflicts
    async fn modify<F>(&self, id: &str, edit: F) -> GuardResult<PermissionRule>
    where
        F: Fn(&mut PermissionRule),
    {
        let mut attempt = 0;
        loop {
            let current = self.get_rule(id).await?;
            let mut updated = current.clone();
            edit(&mut updated);

            match self.store.compare_and_swap(updated, current.version).await {
                Err(GuardError::VersionConflict { .. }) if attempt < self.retry_limit => {
                    attempt += 1;
                    tracing::debug!(attempt, rule_id = %id, "version conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use crate::rules::{
        Action, CellAccess, ColumnAccess, LockAction, Role, RowAccess, TableAccess,
    };
    use crate::store::{LockTarget, MemoryRuleStore};
    use chrono::Utc;

    fn setup() -> (Arc<MemoryRuleStore>, PermissionAdmin) {
        let store = Arc::new(MemoryRuleStore::new());
        let admin = PermissionAdmin::new(store.clone());
        (store, admin)
    }

    fn salary_hidden() -> GrantRequest {
        GrantRequest::new(
            Actor::role(Role::Guest),
            "b1",
            Resource::column("t1", "salary"),
            AccessLevel::Column(ColumnAccess::Hidden),
        )
    }

    #[tokio::test]
    async fn test_grant_is_upsert() {
        let (store, admin) = setup();
        let id = admin
            .grant(salary_hidden().with_name("hide salary").granted_by("a1"))
            .await
            .unwrap();

        let again = admin
            .grant(GrantRequest::new(
                Actor::role(Role::Guest),
                "b1",
                Resource::column("t1", "salary"),
                AccessLevel::Column(ColumnAccess::Readonly),
            ))
            .await
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(store.len().await, 1);

        let rule = admin.get_rule(&id).await.unwrap();
        assert_eq!(rule.access_level, AccessLevel::Column(ColumnAccess::Readonly));
        assert_eq!(rule.name.as_deref(), Some("hide salary"));
        assert_eq!(rule.created_by.as_deref(), Some("a1"));
        assert_eq!(rule.version, 2);
    }

    #[tokio::test]
    async fn test_grant_rejects_bad_shape() {
        let (_store, admin) = setup();
        let err = admin
            .grant(GrantRequest::new(
                Actor::user("u1"),
                "b1",
                Resource::row("t1", "r1"),
                AccessLevel::Cell(CellAccess::Editable),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScopeResourceShape);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_grants_single_enabled_rule() {
        let (store, admin) = setup();
        let admin = admin.with_retry_limit(64);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let admin = admin.clone();
            let level = if i % 2 == 0 {
                RowAccess::ReadOnly
            } else {
                RowAccess::Full
            };
            tasks.push(tokio::spawn(async move {
                admin
                    .grant(GrantRequest::new(
                        Actor::user("u1"),
                        "b1",
                        Resource::row("t1", "r1"),
                        AccessLevel::Row(level),
                    ))
                    .await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(id) => ids.push(id),
                Err(e) => assert_eq!(e.code(), ErrorCode::DuplicateRule),
            }
        }

        let enabled = store
            .list(&RuleFilter::base("b1").enabled_only())
            .await
            .unwrap();
        assert_eq!(enabled.len(), 1);
        assert!(ids.iter().all(|id| *id == enabled[0].id));
    }

    #[tokio::test]
    async fn test_revoke_is_non_destructive() {
        let (store, admin) = setup();
        let id = admin.grant(salary_hidden()).await.unwrap();

        let revoked = admin.revoke(&id).await.unwrap();
        assert!(!revoked.enabled);
        assert_eq!(store.len().await, 1);
        assert!(store
            .list(&RuleFilter::base("b1").enabled_only())
            .await
            .unwrap()
            .is_empty());

        // a fresh grant may take the key while the old one is disabled
        let replacement = admin.grant(salary_hidden()).await.unwrap();
        assert_ne!(replacement, id);

        let err = admin.enable(&id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRule);

        admin.revoke(&replacement).await.unwrap();
        assert!(admin.enable(&id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_revoke_keeps_lock_state_and_history() {
        let (store, admin) = setup();
        let id = admin
            .grant(GrantRequest::new(
                Actor::user("u1"),
                "b1",
                Resource::row("t1", "r1"),
                AccessLevel::Row(RowAccess::Full),
            ))
            .await
            .unwrap();

        let target = LockTarget::new("b1", Resource::row("t1", "r1"));
        let at = Utc::now();
        store.try_acquire_lock(&target, "u1", at).await.unwrap();
        store
            .release_lock("b1", &target.resource, "u1", false, at)
            .await
            .unwrap();
        store.try_acquire_lock(&target, "u1", at).await.unwrap();

        admin.revoke(&id).await.unwrap();

        let rules = admin.list_rules(&RuleFilter::base("b1")).await.unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.id, id);
        assert!(!rule.enabled);
        assert_eq!(rule.locked_by.as_deref(), Some("u1"));
        assert_eq!(rule.locked_at, Some(at));
        let actions: Vec<LockAction> = rule.history.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![LockAction::Lock, LockAction::Unlock, LockAction::Lock]
        );
    }

    #[tokio::test]
    async fn test_set_level_and_actions() {
        let (_store, admin) = setup();
        let id = admin
            .grant(GrantRequest::new(
                Actor::AllMembers,
                "b1",
                Resource::table("t1"),
                AccessLevel::Table(TableAccess::ReadWrite),
            ))
            .await
            .unwrap();

        let rule = admin
            .set_actions(&id, Some(ActionSet::of(&[Action::Read])))
            .await
            .unwrap();
        assert!(!rule.allows(Action::Update));

        let rule = admin.set_actions(&id, None).await.unwrap();
        assert!(rule.allows(Action::Update));

        let err = admin
            .set_access_level(&id, AccessLevel::Row(RowAccess::Full))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScopeResourceShape);

        let rule = admin
            .set_access_level(&id, AccessLevel::Table(TableAccess::NoAccess))
            .await
            .unwrap();
        assert!(!rule.allows(Action::Read));

        let err = admin.revoke("missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RuleNotFound);
    }

    #[tokio::test]
    async fn test_purge_requires_super_admin() {
        let (store, admin) = setup();
        let id = admin.grant(salary_hidden()).await.unwrap();

        let owner = Identity::new("o1", Role::Owner, "b1");
        let err = admin.purge(&owner, &id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert_eq!(store.len().await, 1);

        let root = Identity::new("root", Role::Guest, "b1").as_super_admin();
        admin.purge(&root, &id).await.unwrap();
        assert_eq!(store.len().await, 0);

        let err = admin.purge(&root, &id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RuleNotFound);
    }
}
