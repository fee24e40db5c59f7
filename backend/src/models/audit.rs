use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::user::UserStatus;

/// Lifecycle event recorded in the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Updated,
    Approved,
    Rejected,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Updated => "updated",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
        }
    }

    /// Action recorded when an admin moves a user to `status`.
    pub fn for_status(status: UserStatus) -> Self {
        match status {
            // Only reachable through a direct store call; admins approve or reject.
            UserStatus::Pending => AuditAction::Updated,
            UserStatus::Approved => AuditAction::Approved,
            UserStatus::Rejected => AuditAction::Rejected,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(AuditAction::Created),
            "updated" => Ok(AuditAction::Updated),
            "approved" => Ok(AuditAction::Approved),
            "rejected" => Ok(AuditAction::Rejected),
            other => Err(format!("Unknown audit action: {other}")),
        }
    }
}

/// One row of `app_user_audit`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub subject: String,
    pub action: AuditAction,
    /// Admin email, `None` for self-service events.
    pub actor: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
