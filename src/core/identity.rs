//! Authenticated caller identity
//!
//! Supplied by the session layer with every operation. The engine trusts it
//! as given and never looks users up itself.

use serde::{Deserialize, Serialize};

use crate::rules::Role;

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    /// Role within the base the request targets
    pub role: Role,
    pub base_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    /// Additional role held at site level, if the session layer reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_role: Option<Role>,
    // Reserved platform flag: never deserialize from untrusted input.
    #[serde(default, skip_deserializing)]
    super_admin: bool,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, base_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            base_id: base_id.into(),
            site_id: None,
            site_role: None,
            super_admin: false,
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    pub fn with_site_role(mut self, role: Role) -> Self {
        self.site_role = Some(role);
        self
    }

    /// Mark this identity as a platform super-administrator
    pub fn as_super_admin(mut self) -> Self {
        self.super_admin = true;
        self
    }

    pub fn is_super_admin(&self) -> bool {
        self.super_admin
    }

    /// Every role this identity holds, base role first, without duplicates
    pub fn roles(&self) -> Vec<Role> {
        let mut roles = vec![self.role];
        if let Some(site_role) = self.site_role {
            if site_role != self.role {
                roles.push(site_role);
            }
        }
        roles
    }

    /// May override other users' locks
    pub fn is_administrator(&self) -> bool {
        self.super_admin || self.roles().iter().any(|r| r.is_administrative())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_deduplicated() {
        let id = Identity::new("u1", Role::Member, "b1").with_site_role(Role::Member);
        assert_eq!(id.roles(), vec![Role::Member]);

        let id = Identity::new("u1", Role::Guest, "b1").with_site_role(Role::Admin);
        assert_eq!(id.roles(), vec![Role::Guest, Role::Admin]);
        assert!(id.is_administrator());
    }

    #[test]
    fn test_super_admin_not_deserialized() {
        let json = r#"{"user_id":"u1","role":"guest","base_id":"b1","super_admin":true}"#;
        let id: Identity = serde_json::from_str(json).unwrap();
        assert!(!id.is_super_admin());
        assert!(Identity::new("u1", Role::Guest, "b1")
            .as_super_admin()
            .is_super_admin());
    }
}
