mod chat;
mod group;
pub mod input;
mod message;
mod profile;

pub use chat::{ChatEntry, LastMessage, MessageInfo, ReceiptEntry, EMPTY_GROUP_PREVIEW};
pub use group::{Group, GroupMember, NewGroup};
pub use message::{
    Message, MessagePatch, MessageStatus, MessageTarget, MessageType, NewMessage,
    DELETED_PREVIEW,
};
pub use profile::{Profile, ProfilePatch};

use serde::{Deserialize, Deserializer};

/// The hosted tables return `null` for list columns that were never written.
pub(crate) fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
