use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Serialize, Clone)]
pub struct NewGroup {
    pub name: String,
    pub created_by: String,
}
