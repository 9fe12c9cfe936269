use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::group::Group;
use super::message::{Message, MessageStatus, MessageType};
use super::profile::Profile;

/// Preview for a group that has no messages yet.
pub const EMPTY_GROUP_PREVIEW: &str = "Chat started";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub sender_id: String,
}

impl From<&Message> for LastMessage {
    fn from(msg: &Message) -> Self {
        Self {
            content: msg.preview(),
            created_at: msg.created_at,
            message_type: msg.message_type,
            status: msg.status,
            sender_id: msg.sender_id.clone(),
        }
    }
}

/// One row of the chat list: either a peer user or a group.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatEntry {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub member_count: Option<usize>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_message: Option<LastMessage>,
}

impl ChatEntry {
    pub fn direct(peer_id: &str, profile: Option<&Profile>, last: Option<&Message>) -> Self {
        let email = profile.and_then(|p| p.email.clone());
        Self {
            id: peer_id.to_string(),
            is_group: false,
            name: email.clone(),
            email,
            avatar_url: None,
            member_count: None,
            last_seen: profile.and_then(|p| p.last_seen),
            last_message: last.map(LastMessage::from),
        }
    }

    pub fn group(group: &Group, member_count: usize, last: Option<&Message>) -> Self {
        Self {
            id: group.id.clone(),
            is_group: true,
            name: Some(group.name.clone()),
            email: None,
            avatar_url: group.avatar_url.clone(),
            member_count: Some(member_count),
            last_seen: None,
            last_message: last.map(LastMessage::from),
        }
    }

    pub fn preview(&self) -> &str {
        match &self.last_message {
            Some(last) => &last.content,
            None if self.is_group => EMPTY_GROUP_PREVIEW,
            None => "",
        }
    }

    /// Sort key; chats without messages sort as the epoch.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ReceiptEntry {
    pub user_id: String,
    pub email: Option<String>,
}

/// Who has read a group message, and who has it delivered but unread.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MessageInfo {
    pub message_id: String,
    pub read_by: Vec<ReceiptEntry>,
    pub delivered_to: Vec<ReceiptEntry>,
}
