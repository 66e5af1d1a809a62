//! Lock Coordinator
//!
//! Per row or cell, a two-state machine:
//!
//! | From              | Event              | To                | History        |
//! |-------------------|--------------------|-------------------|----------------|
//! | `UNLOCKED`        | acquire(u)         | `LOCKED(u)`       | `+lock(u)`     |
//! | `LOCKED(u)`       | acquire(u)         | `LOCKED(u)`       | unchanged      |
//! | `LOCKED(u)`       | acquire(v)         | `LOCKED(u)`       | unchanged, deny|
//! | `LOCKED(u)`       | release(u)         | `UNLOCKED`        | `+unlock(u)`   |
//! | `LOCKED(u)`       | release(v)         | `LOCKED(u)`       | unchanged, err |
//! | `LOCKED(u)`       | force_release(a)   | `UNLOCKED`        | `+unlock(a)`   |
//! | `UNLOCKED`        | release(any)       | `UNLOCKED`        | unchanged      |
//!
//! The transitions themselves are the store's conditional writes; this module
//! maps their outcomes to decisions and errors, and provides the pure lock
//! veto used by access checks.

use chrono::Utc;
use std::sync::Arc;

use crate::core::{GuardError, GuardResult, Identity};
use crate::evaluator::{Decision, DenyReason};
use crate::resolver::Coordinate;
use crate::rules::{Action, PermissionRule, Resource};
use crate::store::{LockAcquisition, LockRelease, LockTarget, RuleStore};

/// The resource a lock on `coordinate` is taken on: the cell when both row
/// and column are given, otherwise the row.
pub fn lock_resource(coordinate: &Coordinate) -> GuardResult<Resource> {
    coordinate.lockable_resources().into_iter().next().ok_or_else(|| {
        GuardError::shape(format!(
            "{} does not name a row or cell and cannot be locked",
            coordinate
        ))
    })
}

/// Holder of a lock that vetoes `action` by `user_id` on `coordinate`.
///
/// Only lock-sensitive actions are vetoed, and only by locks on the
/// coordinate's own cell or row. `rules` may contain anything; unrelated
/// rules are ignored.
pub fn veto<'a>(
    rules: &'a [PermissionRule],
    base: &str,
    coordinate: &Coordinate,
    user_id: &str,
    action: Action,
) -> Option<&'a str> {
    if !action.is_lock_sensitive() {
        return None;
    }
    let lockable = coordinate.lockable_resources();
    rules
        .iter()
        .filter(|r| r.base == base && lockable.contains(&r.resource))
        .find(|r| r.is_locked_by_other(user_id))
        .and_then(|r| r.locked_by.as_deref())
}

/// Drives lock transitions through the store
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn RuleStore>,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Take the lock on `resource`. The caller must already have checked the
    /// `lock` action with the evaluator.
    pub async fn acquire(
        &self,
        identity: &Identity,
        base: &str,
        resource: &Resource,
    ) -> GuardResult<Decision> {
        let target = LockTarget::new(base, resource.clone()).with_site(identity.site_id.clone());
        let outcome = self
            .store
            .try_acquire_lock(&target, &identity.user_id, Utc::now())
            .await?;

        match outcome {
            LockAcquisition::Acquired { rule, anchored } => {
                tracing::info!(
                    "[LockCoordinator] {} locked {} in {} (rule {}{})",
                    identity.user_id,
                    resource,
                    base,
                    rule.id,
                    if anchored { ", new anchor" } else { "" }
                );
                Ok(Decision::Allow)
            }
            LockAcquisition::AlreadyHeld { .. } => {
                tracing::debug!(
                    user = %identity.user_id,
                    resource = %resource,
                    "lock already held by requester"
                );
                Ok(Decision::Allow)
            }
            LockAcquisition::HeldByOther { holder } => {
                tracing::debug!(
                    user = %identity.user_id,
                    holder = %holder,
                    resource = %resource,
                    "lock held by another user"
                );
                Ok(Decision::Deny(DenyReason::LockedByOther))
            }
        }
    }

    /// Release a lock held by `identity`. Releasing an unlocked resource is a
    /// no-op; releasing someone else's lock fails with `LOCK_NOT_HELD`.
    pub async fn release(
        &self,
        identity: &Identity,
        base: &str,
        resource: &Resource,
    ) -> GuardResult<()> {
        let outcome = self
            .store
            .release_lock(base, resource, &identity.user_id, false, Utc::now())
            .await?;

        match outcome {
            LockRelease::Released { .. } => {
                tracing::info!(
                    "[LockCoordinator] {} released {} in {}",
                    identity.user_id,
                    resource,
                    base
                );
                Ok(())
            }
            LockRelease::NotLocked => Ok(()),
            LockRelease::HeldByOther { holder } => {
                tracing::warn!(
                    user = %identity.user_id,
                    holder = %holder,
                    resource = %resource,
                    "release refused: lock not held by requester"
                );
                Err(GuardError::LockNotHeld { holder })
            }
        }
    }

    /// Administrative override: release whoever holds the lock. Returns the
    /// previous holder, if the resource was locked.
    pub async fn force_release(
        &self,
        admin: &Identity,
        base: &str,
        resource: &Resource,
    ) -> GuardResult<Option<String>> {
        if !admin.is_administrator() {
            return Err(GuardError::Forbidden(format!(
                "{} may not override locks",
                admin.user_id
            )));
        }

        let outcome = self
            .store
            .release_lock(base, resource, &admin.user_id, true, Utc::now())
            .await?;

        match outcome {
            LockRelease::Released {
                previous_holder, ..
            } => {
                tracing::info!(
                    "[LockCoordinator] {} force-released {} in {} (held by {})",
                    admin.user_id,
                    resource,
                    base,
                    previous_holder
                );
                Ok(Some(previous_holder))
            }
            LockRelease::NotLocked => Ok(None),
            // unreachable with force, kept total
            LockRelease::HeldByOther { holder } => Err(GuardError::LockNotHeld { holder }),
        }
    }
}
