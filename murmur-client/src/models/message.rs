use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::null_as_empty;

/// Preview shown in place of a message that was deleted for everyone.
pub const DELETED_PREVIEW: &str = "Message deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(format!("Invalid message status: {}", other)),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            other => Err(format!("Invalid message type: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub read_by: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub delivered_to: Vec<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted_for: Vec<String>,
    /// Display-only annotation, never written back to the store.
    #[serde(default, skip_serializing)]
    pub sender_email: Option<String>,
}

impl Message {
    /// `deleted_for` hides a message only for the listed viewers.
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        !self.deleted_for.iter().any(|id| id == user_id)
    }

    pub fn is_direct(&self) -> bool {
        self.group_id.is_none()
    }

    /// The other side of a direct message, seen from `user_id`.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if !self.is_direct() {
            return None;
        }
        if self.sender_id == user_id {
            self.receiver_id.as_deref()
        } else {
            Some(self.sender_id.as_str())
        }
    }

    /// Id of the chat this message belongs to, seen from `user_id`.
    pub fn chat_id_for(&self, user_id: &str) -> Option<&str> {
        match &self.group_id {
            Some(group_id) => Some(group_id.as_str()),
            None => self.peer_of(user_id),
        }
    }

    /// Whether the message belongs to the chat with `chat_id`.
    pub fn belongs_to(&self, chat_id: &str, is_group: bool) -> bool {
        if is_group {
            self.group_id.as_deref() == Some(chat_id)
        } else {
            self.is_direct()
                && (self.sender_id == chat_id || self.receiver_id.as_deref() == Some(chat_id))
        }
    }

    pub fn preview(&self) -> String {
        if self.is_deleted {
            DELETED_PREVIEW.to_string()
        } else {
            self.content.clone()
        }
    }
}

/// Where a new message goes. A message has exactly one of receiver or group.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageTarget {
    Direct(String),
    Group(String),
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: String,
    pub target: MessageTarget,
    pub message_type: MessageType,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewMessageRow<'a> {
    pub content: &'a str,
    pub sender_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<&'a str>,
    pub status: MessageStatus,
    pub message_type: MessageType,
}

impl NewMessage {
    pub fn receiver_id(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Direct(id) => Some(id),
            MessageTarget::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Group(id) => Some(id),
            MessageTarget::Direct(_) => None,
        }
    }

    pub(crate) fn row(&self) -> NewMessageRow<'_> {
        NewMessageRow {
            content: &self.content,
            sender_id: &self.sender_id,
            receiver_id: self.receiver_id(),
            group_id: self.group_id(),
            status: MessageStatus::Sent,
            message_type: self.message_type,
        }
    }
}

/// Partial message update; unset fields are left untouched.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_to: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_for: Option<Vec<String>>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the patch to a local copy.
    pub fn apply(&self, message: &mut Message) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(read_by) = &self.read_by {
            message.read_by = read_by.clone();
        }
        if let Some(delivered_to) = &self.delivered_to {
            message.delivered_to = delivered_to.clone();
        }
        if let Some(is_deleted) = self.is_deleted {
            message.is_deleted = is_deleted;
        }
        if let Some(deleted_for) = &self.deleted_for {
            message.deleted_for = deleted_for.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(sender: &str, receiver: &str) -> Message {
        Message {
            id: "m1".to_string(),
            content: "hi".to_string(),
            sender_id: sender.to_string(),
            receiver_id: Some(receiver.to_string()),
            group_id: None,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
            message_type: MessageType::Text,
            read_by: vec![],
            delivered_to: vec![],
            is_deleted: false,
            deleted_for: vec![],
            sender_email: None,
        }
    }

    #[test]
    fn test_peer_of_direct_message() {
        let msg = direct("alice", "bob");
        assert_eq!(msg.peer_of("alice"), Some("bob"));
        assert_eq!(msg.peer_of("bob"), Some("alice"));
        assert_eq!(msg.chat_id_for("bob"), Some("alice"));
    }

    #[test]
    fn test_group_message_never_belongs_to_direct_chat() {
        let mut msg = direct("alice", "bob");
        msg.receiver_id = None;
        msg.group_id = Some("g1".to_string());

        assert!(msg.belongs_to("g1", true));
        assert!(!msg.belongs_to("alice", false));
        assert_eq!(msg.peer_of("bob"), None);
        assert_eq!(msg.chat_id_for("bob"), Some("g1"));
    }

    #[test]
    fn test_deleted_for_hides_only_listed_viewers() {
        let mut msg = direct("alice", "bob");
        msg.deleted_for = vec!["bob".to_string()];
        assert!(!msg.is_visible_to("bob"));
        assert!(msg.is_visible_to("alice"));
    }

    #[test]
    fn test_deleted_message_preview() {
        let mut msg = direct("alice", "bob");
        msg.is_deleted = true;
        assert_eq!(msg.preview(), DELETED_PREVIEW);
    }

    #[test]
    fn test_decode_hosted_row() {
        let json = r#"{
            "id": "m9",
            "content": "hello",
            "sender_id": "u1",
            "receiver_id": null,
            "group_id": "g1",
            "created_at": "2024-05-01T10:15:00.123456+00:00",
            "status": "delivered",
            "message_type": "image",
            "read_by": null,
            "delivered_to": ["u2"],
            "is_deleted": false,
            "deleted_for": null
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.message_type, MessageType::Image);
        assert!(msg.read_by.is_empty());
        assert_eq!(msg.delivered_to, vec!["u2".to_string()]);
    }

    #[test]
    fn test_sender_email_is_not_written_back() {
        let mut msg = direct("alice", "bob");
        msg.sender_email = Some("alice@example.com".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("sender_email"));
    }

    #[test]
    fn test_new_message_row_sets_exactly_one_target() {
        let msg = NewMessage {
            content: "yo".to_string(),
            sender_id: "u1".to_string(),
            target: MessageTarget::Group("g1".to_string()),
            message_type: MessageType::Text,
        };
        let json = serde_json::to_value(msg.row()).unwrap();
        assert_eq!(json["group_id"], "g1");
        assert!(json.get("receiver_id").is_none());
        assert_eq!(json["status"], "sent");
    }

    #[test]
    fn test_patch_apply() {
        let mut msg = direct("alice", "bob");
        let patch = MessagePatch {
            status: Some(MessageStatus::Read),
            read_by: Some(vec!["bob".to_string()]),
            ..Default::default()
        };
        patch.apply(&mut msg);
        assert_eq!(msg.status, MessageStatus::Read);
        assert_eq!(msg.read_by, vec!["bob".to_string()]);
        assert!(!MessagePatch::status(MessageStatus::Read).is_empty());
        assert!(MessagePatch::default().is_empty());
    }
}
