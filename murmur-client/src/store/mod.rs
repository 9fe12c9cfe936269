//! Backend abstraction over the hosted tables (`profiles`, `messages`,
//! `groups`, `group_members`) and their change feed.

mod remote;
mod sqlite;

pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{
    Group, GroupMember, Message, MessagePatch, MessageStatus, NewGroup, NewMessage, Profile,
    ProfilePatch,
};

/// Capacity of the change-feed broadcast channel
pub(crate) const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change on the `messages` table.
///
/// `record` is the row after the change; deletes carry no record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: Option<Message>,
}

impl ChangeEvent {
    pub fn insert(record: Message) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record: Some(record),
        }
    }

    pub fn update(record: Message) -> Self {
        Self {
            kind: ChangeKind::Update,
            record: Some(record),
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn list_profiles(&self) -> Result<Vec<Profile>>;

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>>;

    async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> Result<()>;

    /// Direct messages sent or received by `user_id`, newest first.
    async fn direct_messages_for(&self, user_id: &str) -> Result<Vec<Message>>;

    /// Both directions of a direct conversation, oldest first.
    async fn conversation(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>>;

    /// Messages of the given groups, newest first.
    async fn group_messages(&self, group_ids: &[String]) -> Result<Vec<Message>>;

    /// Messages of one group, oldest first.
    async fn group_thread(&self, group_id: &str) -> Result<Vec<Message>>;

    /// Groups `user_id` is a member of.
    async fn groups_of(&self, user_id: &str) -> Result<Vec<Group>>;

    async fn members_of(&self, group_ids: &[String]) -> Result<Vec<GroupMember>>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message>;

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()>;

    async fn update_messages(&self, message_ids: &[String], patch: &MessagePatch) -> Result<()>;

    /// Like `update_messages`, but only rows whose status is still `current` change.
    async fn update_messages_with_status(
        &self,
        message_ids: &[String],
        current: MessageStatus,
        patch: &MessagePatch,
    ) -> Result<()>;

    async fn create_group(&self, group: &NewGroup) -> Result<Group>;

    async fn add_members(&self, members: &[GroupMember]) -> Result<()>;

    /// Subscribe to row changes on `messages`.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
