//! File-backed rule store
//!
//! Layout under the store directory:
//!
//! ```text
//! rules.json    full snapshot of every rule, rewritten through a temp file + rename
//! audit.jsonl   one AuditEvent per line, append-only
//! ```
//!
//! A mutation is applied to a copy of the table, the copy is persisted, and
//! only then does it replace the live table. Persisting stages the snapshot,
//! appends the audit events, and renames the snapshot into place last; a
//! failed write leaves both disk and memory at the previous state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::core::{GuardError, GuardResult};
use crate::rules::{PermissionRule, Resource, RuleId};

use super::table::RuleTable;
use super::{LockAcquisition, LockRelease, LockTarget, RuleFilter, RuleStore};

const RULES_FILE: &str = "rules.json";
const AUDIT_FILE: &str = "audit.jsonl";

/// What happened to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Inserted,
    Updated,
    Enabled,
    Disabled,
    Locked,
    Unlocked,
    Purged,
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub rule_id: RuleId,
    pub base: String,
    pub resource: Resource,
    /// User that triggered the event, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    pub version: u64,
}

impl AuditEvent {
    fn for_rule(kind: AuditKind, rule: &PermissionRule, by: Option<&str>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            rule_id: rule.id.clone(),
            base: rule.base.clone(),
            resource: rule.resource.clone(),
            by: by.map(str::to_string),
            version: rule.version,
        }
    }
}

/// Rule store persisted as JSON files in one directory
#[derive(Debug)]
pub struct FileRuleStore {
    dir: PathBuf,
    table: RwLock<RuleTable>,
}

impl FileRuleStore {
    /// Open (or create) a store in `dir`, loading and validating any snapshot
    pub fn open(dir: impl Into<PathBuf>) -> GuardResult<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let rules_path = dir.join(RULES_FILE);
        let table = if rules_path.exists() {
            let reader = BufReader::new(File::open(&rules_path)?);
            let rules: Vec<PermissionRule> = serde_json::from_reader(reader)?;
            RuleTable::from_rules(rules)?
        } else {
            RuleTable::default()
        };

        tracing::info!(
            "[RuleStore] Opened file store at {:?} with {} rules",
            dir,
            table.len()
        );

        Ok(Self {
            dir,
            table: RwLock::new(table),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rules_path(&self) -> PathBuf {
        self.dir.join(RULES_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.dir.join(AUDIT_FILE)
    }

    /// Read the whole audit log
    pub fn audit_log(&self) -> GuardResult<Vec<AuditEvent>> {
        let path = self.audit_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn write_temp_snapshot(&self, rules: &[PermissionRule]) -> GuardResult<PathBuf> {
        let tmp = self.dir.join(format!("{}.tmp", RULES_FILE));
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, rules)?;
        writer.flush()?;
        Ok(tmp)
    }

    fn append_audit(&self, events: &[AuditEvent]) -> GuardResult<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path())?;
        for event in events {
            let json = serde_json::to_string(event)?;
            writeln!(file, "{}", json)?;
        }
        Ok(())
    }

    /// Cut the audit log back to `len` bytes after a failed persist
    fn truncate_audit(&self, len: u64) {
        let result = fs::OpenOptions::new()
            .write(true)
            .open(self.audit_path())
            .and_then(|file| file.set_len(len));
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not roll back audit log to {} bytes", len);
        }
    }

    /// Stage the snapshot, append the audit events, then publish the
    /// snapshot. Any failure rolls the audit log back and leaves `rules.json`
    /// untouched.
    fn persist(&self, rules: &[PermissionRule], events: &[AuditEvent]) -> GuardResult<()> {
        let tmp = self.write_temp_snapshot(rules)?;
        let audit_len = fs::metadata(self.audit_path()).map(|m| m.len()).unwrap_or(0);

        let result = self
            .append_audit(events)
            .and_then(|()| fs::rename(&tmp, self.rules_path()).map_err(GuardError::from));
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                tracing::debug!(error = %cleanup, "no staged snapshot to remove");
            }
            self.truncate_audit(audit_len);
            return Err(e);
        }
        Ok(())
    }

    /// Apply `op` to a copy of the table; persist and publish it if the
    /// operation produced audit events.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut RuleTable) -> GuardResult<(T, Vec<AuditEvent>)>,
    ) -> GuardResult<T> {
        let mut table = self.table.write().await;
        let mut next = table.clone();
        let (out, events) = op(&mut next)?;

        if !events.is_empty() {
            self.persist(&next.snapshot(), &events)?;
            *table = next;
        }
        Ok(out)
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
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
        self.mutate(|table| {
            let stored = table.insert_unique(rule)?;
            let event =
                AuditEvent::for_rule(AuditKind::Inserted, &stored, stored.created_by.as_deref());
            Ok((stored, vec![event]))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        rule: PermissionRule,
        expected_version: u64,
    ) -> GuardResult<PermissionRule> {
        self.mutate(|table| {
            let was_enabled = table.get(&rule.id).map(|r| r.enabled);
            let stored = table.compare_and_swap(rule, expected_version)?;
            let kind = match (was_enabled, stored.enabled) {
                (Some(true), false) => AuditKind::Disabled,
                (Some(false), true) => AuditKind::Enabled,
                _ => AuditKind::Updated,
            };
            let event = AuditEvent::for_rule(kind, &stored, None);
            Ok((stored, vec![event]))
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        target: &LockTarget,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> GuardResult<LockAcquisition> {
        self.mutate(|table| {
            let outcome = table.try_acquire_lock(target, user_id, at)?;
            let events = match &outcome {
                LockAcquisition::Acquired { rule, anchored } => {
                    let mut events = Vec::new();
                    if *anchored {
                        events.push(AuditEvent::for_rule(AuditKind::Inserted, rule, Some(user_id)));
                    }
                    events.push(AuditEvent::for_rule(AuditKind::Locked, rule, Some(user_id)));
                    events
                }
                _ => Vec::new(),
            };
            Ok((outcome, events))
        })
        .await
    }

    async fn release_lock(
        &self,
        base: &str,
        resource: &Resource,
        user_id: &str,
        force: bool,
        at: DateTime<Utc>,
    ) -> GuardResult<LockRelease> {
        self.mutate(|table| {
            let outcome = table.release_lock(base, resource, user_id, force, at);
            let events = match &outcome {
                LockRelease::Released { rule, .. } => {
                    vec![AuditEvent::for_rule(AuditKind::Unlocked, rule, Some(user_id))]
                }
                _ => Vec::new(),
            };
            Ok((outcome, events))
        })
        .await
    }

    async fn purge(&self, id: &str) -> GuardResult<Option<PermissionRule>> {
        self.mutate(|table| {
            let removed = table.purge(id);
            let events = removed
                .iter()
                .map(|rule| AuditEvent::for_rule(AuditKind::Purged, rule, None))
                .collect();
            Ok((removed, events))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AccessLevel, Actor, ColumnAccess, Role};
    use tempfile::TempDir;

    fn create_test_store() -> (FileRuleStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileRuleStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn column_rule() -> PermissionRule {
        PermissionRule::new(
            Actor::role(Role::Guest),
            "b1",
            Resource::column("t1", "salary"),
            AccessLevel::Column(ColumnAccess::Hidden),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let (store, temp) = create_test_store();
        let rule = store.insert_unique(column_rule()).await.unwrap();
        let target = LockTarget::new("b1", Resource::row("t1", "r1"));
        store
            .try_acquire_lock(&target, "u1", Utc::now())
            .await
            .unwrap();
        drop(store);

        let reopened = FileRuleStore::open(temp.path()).unwrap();
        let loaded = reopened.get(&rule.id).await.unwrap().unwrap();
        assert_eq!(loaded, rule);

        let rows = reopened
            .rules_for("b1", &[Resource::row("t1", "r1")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].locked_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_audit_log_records_mutations() {
        let (store, _temp) = create_test_store();
        let rule = store.insert_unique(column_rule()).await.unwrap();

        let mut disabled = rule.clone();
        disabled.enabled = false;
        store.compare_and_swap(disabled, rule.version).await.unwrap();
        store.purge(&rule.id).await.unwrap();

        let kinds: Vec<AuditKind> = store.audit_log().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AuditKind::Inserted, AuditKind::Disabled, AuditKind::Purged]
        );
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let (store, _temp) = create_test_store();
        store.insert_unique(column_rule()).await.unwrap();
        assert!(store.insert_unique(column_rule()).await.is_err());

        assert_eq!(store.audit_log().unwrap().len(), 1);
        let release = store
            .release_lock("b1", &Resource::row("t1", "r1"), "u1", false, Utc::now())
            .await
            .unwrap();
        assert_eq!(release, LockRelease::NotLocked);
        assert_eq!(store.audit_log().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_audit_append_keeps_disk_and_memory_in_step() {
        let (store, temp) = create_test_store();
        let kept = store.insert_unique(column_rule()).await.unwrap();

        // An unwritable audit log fails every mutation
        std::fs::remove_file(store.audit_path()).unwrap();
        std::fs::create_dir(store.audit_path()).unwrap();

        let mut rule = column_rule();
        rule.resource = Resource::column("t1", "bonus");
        let rejected = rule.id.clone();
        assert!(store.insert_unique(rule).await.is_err());
        assert!(store.get(&rejected).await.unwrap().is_none());
        assert!(!temp.path().join(format!("{}.tmp", RULES_FILE)).exists());
        drop(store);

        let reopened = FileRuleStore::open(temp.path()).unwrap();
        assert!(reopened.get(&rejected).await.unwrap().is_none());
        assert_eq!(reopened.get(&kept.id).await.unwrap(), Some(kept));
    }

    #[test]
    fn test_open_rejects_malformed_snapshot() {
        let temp = TempDir::new().unwrap();
        let mut rule = column_rule();
        rule.access_level = AccessLevel::Column(ColumnAccess::Visible);
        rule.resource = Resource::table("t1");
        std::fs::write(
            temp.path().join(RULES_FILE),
            serde_json::to_string(&vec![rule]).unwrap(),
        )
        .unwrap();

        let err = FileRuleStore::open(temp.path()).unwrap_err();
        assert_eq!(
            err.code(),
            crate::core::ErrorCode::InvalidScopeResourceShape
        );
    }
}
