//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Environment variables overlay a loaded file:
//!
//! | Variable                      | Field                 |
//! |-------------------------------|-----------------------|
//! | `GRIDGUARD_STORE_DIR`         | `store = file { dir }`|
//! | `GRIDGUARD_STORE_TIMEOUT_MS`  | `store_timeout_ms`    |
//! | `GRIDGUARD_LOG`               | `logging.filter`      |
//! | `GRIDGUARD_LOG_JSON`          | `logging.json`        |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{GuardError, GuardResult};
use crate::rules::{Action, ActionSet, Role};

/// Actions each role may perform when no rule matches at any scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefaults {
    #[serde(default = "ActionSet::all")]
    pub owner: ActionSet,
    #[serde(default = "ActionSet::all")]
    pub admin: ActionSet,
    #[serde(default = "default_member_actions")]
    pub member: ActionSet,
    #[serde(default = "default_guest_actions")]
    pub guest: ActionSet,
}

fn default_member_actions() -> ActionSet {
    ActionSet::of(&[Action::Create, Action::Read, Action::Update])
}

fn default_guest_actions() -> ActionSet {
    ActionSet::of(&[Action::Read])
}

impl Default for RoleDefaults {
    fn default() -> Self {
        Self {
            owner: ActionSet::all(),
            admin: ActionSet::all(),
            member: default_member_actions(),
            guest: default_guest_actions(),
        }
    }
}

impl RoleDefaults {
    pub fn for_role(&self, role: Role) -> &ActionSet {
        match role {
            Role::Owner => &self.owner,
            Role::Admin => &self.admin,
            Role::Member => &self.member,
            Role::Guest => &self.guest,
        }
    }

    pub fn with_role(mut self, role: Role, actions: ActionSet) -> Self {
        match role {
            Role::Owner => self.owner = actions,
            Role::Admin => self.admin = actions,
            Role::Member => self.member = actions,
            Role::Guest => self.guest = actions,
        }
        self
    }
}

/// How grants from several roles held by one user combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleCombination {
    /// The most permissive role grant wins
    #[default]
    MostPermissive,
    /// The most restrictive role grant wins
    MostRestrictive,
}

/// Which rule store backend to open
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// JSON snapshot plus audit log under `dir`
    File { dir: PathBuf },
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "gridguard=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            directory: None,
        }
    }
}

/// Top-level configuration for [`PermissionGuard`](crate::guard::PermissionGuard)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub store: StoreConfig,

    /// Upper bound on any single store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default)]
    pub role_defaults: RoleDefaults,

    #[serde(default)]
    pub role_combination: RoleCombination,

    /// Base owners skip rule evaluation and get the owner defaults
    #[serde(default)]
    pub owners_bypass_rules: bool,

    /// Compare-and-swap attempts a grant makes before reporting a duplicate
    #[serde(default = "default_grant_retry_limit")]
    pub grant_retry_limit: u32,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_grant_retry_limit() -> u32 {
    3
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            store_timeout_ms: default_store_timeout_ms(),
            role_defaults: RoleDefaults::default(),
            role_combination: RoleCombination::default(),
            owners_bypass_rules: false,
            grant_retry_limit: default_grant_retry_limit(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> GuardResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: GuardConfig = serde_json::from_str(&raw)
            .map_err(|e| GuardError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> GuardResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlay environment variables onto this config
    pub fn with_env_overrides(self) -> GuardResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> GuardResult<Self> {
        if let Some(dir) = lookup("GRIDGUARD_STORE_DIR") {
            self.store = StoreConfig::File { dir: dir.into() };
        }
        if let Some(ms) = lookup("GRIDGUARD_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = ms.parse().map_err(|_| {
                GuardError::InvalidConfig(format!("GRIDGUARD_STORE_TIMEOUT_MS is not a number: {}", ms))
            })?;
        }
        if let Some(filter) = lookup("GRIDGUARD_LOG") {
            self.logging.filter = filter;
        }
        if let Some(json) = lookup("GRIDGUARD_LOG_JSON") {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.store_timeout_ms == 0 {
            return Err(GuardError::InvalidConfig(
                "store_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.grant_retry_limit == 0 {
            return Err(GuardError::InvalidConfig(
                "grant_retry_limit must be at least 1".into(),
            ));
        }
        if let StoreConfig::File { dir } = &self.store {
            if dir.as_os_str().is_empty() {
                return Err(GuardError::InvalidConfig("file store needs a directory".into()));
            }
        }
        Ok(())
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_store_timeout(mut self, timeout_ms: u64) -> Self {
        self.store_timeout_ms = timeout_ms;
        self
    }

    pub fn with_role_defaults(mut self, defaults: RoleDefaults) -> Self {
        self.role_defaults = defaults;
        self
    }

    pub fn with_role_combination(mut self, combination: RoleCombination) -> Self {
        self.role_combination = combination;
        self
    }

    pub fn with_owners_bypass(mut self, enabled: bool) -> Self {
        self.owners_bypass_rules = enabled;
        self
    }

    pub fn with_grant_retry_limit(mut self, limit: u32) -> Self {
        self.grant_retry_limit = limit;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_empty_json_is_default() {
        let config: GuardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert!(config.role_defaults.member.contains(Action::Update));
        assert!(!config.role_defaults.member.contains(Action::Delete));
        assert_eq!(config.role_defaults.guest, ActionSet::of(&[Action::Read]));
    }

    #[test]
    fn test_partial_role_defaults() {
        let config: GuardConfig =
            serde_json::from_str(r#"{"role_defaults":{"guest":[]},"role_combination":"most_restrictive"}"#)
                .unwrap();
        assert!(config.role_defaults.guest.is_empty());
        assert_eq!(config.role_defaults.owner, ActionSet::all());
        assert_eq!(config.role_combination, RoleCombination::MostRestrictive);
    }

    #[test]
    fn test_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("guard.json");
        std::fs::write(
            &path,
            r#"{"store":{"backend":"file","dir":"/var/lib/gridguard"},"store_timeout_ms":500}"#,
        )
        .unwrap();

        let config = GuardConfig::from_file(&path).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::File {
                dir: PathBuf::from("/var/lib/gridguard")
            }
        );
        assert_eq!(config.store_timeout_ms, 500);
    }

    #[test]
    fn test_invalid_file_reports_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("guard.json");
        std::fs::write(&path, r#"{"store_timeout_ms":0}"#).unwrap();
        assert!(matches!(
            GuardConfig::from_file(&path),
            Err(GuardError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GRIDGUARD_STORE_DIR", "/tmp/rules"),
            ("GRIDGUARD_STORE_TIMEOUT_MS", "250"),
            ("GRIDGUARD_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let config = GuardConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store_timeout_ms, 250);
        assert!(config.logging.json);
        assert!(matches!(config.store, StoreConfig::File { .. }));

        let bad = GuardConfig::default()
            .with_overrides(|key| (key == "GRIDGUARD_STORE_TIMEOUT_MS").then(|| "soon".to_string()));
        assert!(bad.is_err());
    }
}
