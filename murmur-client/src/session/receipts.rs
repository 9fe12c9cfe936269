//! Delivery and read receipt planning.
//!
//! Status only moves forward: a message already `read` is never written
//! back to `delivered`. Plans are built from a snapshot that may be stale by
//! the time they are written, so the `sent -> delivered` step goes through
//! `ChatStore::update_messages_with_status` and list patches never carry a
//! downgraded status.

use std::collections::HashMap;

use crate::models::{Message, MessagePatch, MessageStatus};

/// Group member count assumed when the chat entry does not carry one.
pub const DEFAULT_MEMBER_COUNT: usize = 2;

/// Direct messages addressed to me that are still `sent`.
pub fn direct_delivery_ids(user_id: &str, direct: &[Message]) -> Vec<String> {
    direct
        .iter()
        .filter(|m| m.receiver_id.as_deref() == Some(user_id) && m.status == MessageStatus::Sent)
        .map(|m| m.id.clone())
        .collect()
}

/// Group messages from others that do not list me in `delivered_to` yet.
///
/// Patches only touch `delivered_to`; the status bump is a separate guarded write.
pub fn group_delivery_patches(user_id: &str, group_messages: &[Message]) -> Vec<(String, MessagePatch)> {
    group_messages
        .iter()
        .filter(|m| m.group_id.is_some() && m.sender_id != user_id)
        .filter(|m| !m.delivered_to.iter().any(|id| id == user_id))
        .map(|m| {
            let mut delivered_to = m.delivered_to.clone();
            delivered_to.push(user_id.to_string());
            (
                m.id.clone(),
                MessagePatch {
                    delivered_to: Some(delivered_to),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Messages of an open direct chat sent by the peer and not yet `read`.
pub fn direct_read_ids(user_id: &str, thread: &[Message]) -> Vec<String> {
    thread
        .iter()
        .filter(|m| m.sender_id != user_id && m.status != MessageStatus::Read)
        .map(|m| m.id.clone())
        .collect()
}

/// Read receipts for an open group chat.
///
/// I am appended to `read_by`; the message becomes `read` once every other
/// member has read it. Below that threshold the status is left alone.
pub fn group_read_patches(
    user_id: &str,
    thread: &[Message],
    member_count: Option<usize>,
) -> Vec<(String, MessagePatch)> {
    let others = member_count
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MEMBER_COUNT)
        .saturating_sub(1);
    thread
        .iter()
        .filter(|m| m.sender_id != user_id && !m.read_by.iter().any(|id| id == user_id))
        .map(|m| {
            let mut read_by = m.read_by.clone();
            read_by.push(user_id.to_string());
            let status = (read_by.len() >= others).then_some(MessageStatus::Read);
            (
                m.id.clone(),
                MessagePatch {
                    status,
                    read_by: Some(read_by),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// Unread counters keyed by chat id (peer id for direct chats, group id otherwise).
///
/// Messages hidden from me with `deleted_for` do not count.
pub fn unread_counts(user_id: &str, direct: &[Message], group_messages: &[Message]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();

    for m in direct {
        if m.group_id.is_none()
            && m.receiver_id.as_deref() == Some(user_id)
            && m.status != MessageStatus::Read
            && m.is_visible_to(user_id)
        {
            *counts.entry(m.sender_id.clone()).or_insert(0) += 1;
        }
    }

    for m in group_messages {
        let Some(group_id) = &m.group_id else {
            continue;
        };
        if m.status != MessageStatus::Read
            && m.sender_id != user_id
            && !m.read_by.iter().any(|id| id == user_id)
            && m.is_visible_to(user_id)
        {
            *counts.entry(group_id.clone()).or_insert(0) += 1;
        }
    }

    counts
}
