use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::null_as_empty;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub pinned_users: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub blocked_users: Vec<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: Some(email.into()),
            last_seen: None,
            pinned_users: Vec::new(),
            blocked_users: Vec::new(),
        }
    }

    /// Profiles are shown by email address.
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.id)
    }
}

/// Partial profile update; unset fields are left untouched.
#[derive(Debug, Serialize, Default, Clone)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_users: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_users: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_lists_decode_as_empty() {
        let json = r#"{"id":"u1","email":"a@b.co","last_seen":null,"pinned_users":null,"blocked_users":null}"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert!(profile.pinned_users.is_empty());
        assert!(profile.blocked_users.is_empty());
        assert_eq!(profile.display_name(), "a@b.co");
    }

    #[test]
    fn test_patch_skips_unset_fields() {
        let patch = ProfilePatch {
            pinned_users: Some(vec!["u2".to_string()]),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"pinned_users":["u2"]}"#);
    }
}
