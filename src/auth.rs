//! Resolved caller identity. Token validation happens upstream; the
//! controller only needs who the caller is and what they may do.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    ReadOnly,
    /// Worker agents: may report test status, may not submit or modify.
    Worker,
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub permission: Permission,
}

impl AuthContext {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            permission: Permission::User,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            permission: Permission::Admin,
        }
    }

    pub fn worker(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            permission: Permission::Worker,
        }
    }

    /// Internal caller (the scheduler loop acting for a stored owner).
    pub fn system() -> Self {
        Self {
            user_id: None,
            permission: Permission::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.permission == Permission::Admin
    }

    pub fn can_write(&self) -> bool {
        self.permission >= Permission::User
    }

    /// Only workers and admins may push status for a test.
    pub fn may_report_status(&self) -> bool {
        matches!(self.permission, Permission::Worker | Permission::Admin)
    }

    /// Admins may act on anything; others only on what they own. Entries
    /// without an owner are open to any writer.
    pub fn may_modify(&self, owner: Option<&str>) -> bool {
        if self.is_admin() {
            return true;
        }
        if !self.can_write() {
            return false;
        }
        match owner {
            None => true,
            Some(owner) => self.user_id.as_deref() == Some(owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_may_modify() {
        let alice = AuthContext::user("alice");
        assert!(alice.may_modify(Some("alice")));
        assert!(!alice.may_modify(Some("bob")));
        assert!(alice.may_modify(None));
        assert!(AuthContext::admin("root").may_modify(Some("bob")));
        let reader = AuthContext {
            user_id: Some("carol".into()),
            permission: Permission::ReadOnly,
        };
        assert!(!reader.may_modify(Some("carol")));
    }

    #[test]
    fn test_worker_reports_but_cannot_write() {
        let worker = AuthContext::worker("agent-1");
        assert!(worker.may_report_status());
        assert!(!worker.can_write());
        assert!(!worker.may_modify(None));
        assert!(!AuthContext::user("alice").may_report_status());
        assert!(AuthContext::admin("root").may_report_status());
    }
}
