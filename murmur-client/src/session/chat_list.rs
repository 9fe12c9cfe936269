//! Chat list derivation from raw rows.

use std::collections::{HashMap, HashSet};

use crate::models::{ChatEntry, Group, GroupMember, Message, Profile};

pub fn member_counts(members: &[GroupMember]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for member in members {
        *counts.entry(member.group_id.clone()).or_insert(0) += 1;
    }
    counts
}

/// Distinct peers of the visible direct messages, in first-seen order.
pub fn peer_ids(user_id: &str, direct: &[Message]) -> Vec<String> {
    let mut seen = HashSet::new();
    direct
        .iter()
        .filter(|m| m.is_visible_to(user_id))
        .filter_map(|m| m.peer_of(user_id))
        .filter(|peer| seen.insert(peer.to_string()))
        .map(String::from)
        .collect()
}

/// Build the unsorted chat list.
///
/// `direct` and `group_messages` must be newest first: the first visible
/// message per chat becomes its last message.
pub fn build_chat_list(
    user_id: &str,
    direct: &[Message],
    groups: &[Group],
    counts: &HashMap<String, usize>,
    group_messages: &[Message],
    profiles: &[Profile],
) -> Vec<ChatEntry> {
    let mut entries: Vec<ChatEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for msg in direct.iter().filter(|m| m.is_visible_to(user_id)) {
        let Some(peer) = msg.peer_of(user_id) else {
            continue;
        };
        if index.contains_key(peer) {
            continue;
        }
        let profile = profiles.iter().find(|p| p.id == peer);
        index.insert(peer.to_string(), entries.len());
        entries.push(ChatEntry::direct(peer, profile, Some(msg)));
    }

    for group in groups {
        let last = group_messages
            .iter()
            .find(|m| m.group_id.as_deref() == Some(group.id.as_str()) && m.is_visible_to(user_id));
        let count = counts.get(&group.id).copied().unwrap_or(0);
        let entry = ChatEntry::group(group, count, last);
        match index.get(&group.id) {
            Some(&pos) => entries[pos] = entry,
            None => {
                index.insert(group.id.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    entries
}

/// Pinned chats first, then newest activity first.
pub fn sort_chat_list(entries: &mut [ChatEntry], pinned: &[String]) {
    entries.sort_by(|a, b| {
        let a_pinned = pinned.contains(&a.id);
        let b_pinned = pinned.contains(&b.id);
        b_pinned
            .cmp(&a_pinned)
            .then_with(|| b.last_activity().cmp(&a.last_activity()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageStatus, MessageType, DELETED_PREVIEW, EMPTY_GROUP_PREVIEW};
    use chrono::{Duration, Utc};

    fn msg(id: &str, sender: &str, receiver: Option<&str>, group: Option<&str>, age_secs: i64) -> Message {
        Message {
            id: id.to_string(),
            content: format!("content of {}", id),
            sender_id: sender.to_string(),
            receiver_id: receiver.map(String::from),
            group_id: group.map(String::from),
            created_at: Utc::now() - Duration::seconds(age_secs),
            status: MessageStatus::Sent,
            message_type: MessageType::Text,
            read_by: vec![],
            delivered_to: vec![],
            is_deleted: false,
            deleted_for: vec![],
            sender_email: None,
        }
    }

    fn group(id: &str, name: &str) -> Group {
        Group {
            id: id.to_string(),
            name: name.to_string(),
            avatar_url: None,
            created_by: None,
            created_at: None,
        }
    }

    #[test]
    fn test_newest_direct_message_wins() {
        let direct = vec![
            msg("m3", "bob", Some("me"), None, 10),
            msg("m2", "me", Some("bob"), None, 20),
            msg("m1", "carol", Some("me"), None, 30),
        ];
        let profiles = vec![Profile::new("bob", "bob@example.com")];
        let list = build_chat_list("me", &direct, &[], &HashMap::new(), &[], &profiles);

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "bob");
        assert_eq!(list[0].preview(), "content of m3");
        assert_eq!(list[0].email.as_deref(), Some("bob@example.com"));
        assert_eq!(list[1].id, "carol");
        assert!(list[1].email.is_none());
    }

    #[test]
    fn test_deleted_for_me_is_skipped() {
        let mut hidden = msg("m2", "bob", Some("me"), None, 10);
        hidden.deleted_for = vec!["me".to_string()];
        let direct = vec![hidden, msg("m1", "me", Some("bob"), None, 20)];

        let list = build_chat_list("me", &direct, &[], &HashMap::new(), &[], &[]);
        assert_eq!(list[0].preview(), "content of m1");
        assert_eq!(peer_ids("me", &direct), vec!["bob".to_string()]);
    }

    #[test]
    fn test_group_entries() {
        let groups = vec![group("g1", "Climbing"), group("g2", "Quiet")];
        let members = vec![
            GroupMember { group_id: "g1".into(), user_id: "me".into(), is_admin: true },
            GroupMember { group_id: "g1".into(), user_id: "bob".into(), is_admin: false },
            GroupMember { group_id: "g2".into(), user_id: "me".into(), is_admin: false },
        ];
        let mut deleted = msg("gm2", "bob", None, Some("g1"), 5);
        deleted.is_deleted = true;
        let group_messages = vec![deleted, msg("gm1", "me", None, Some("g1"), 50)];

        let list = build_chat_list("me", &[], &groups, &member_counts(&members), &group_messages, &[]);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].member_count, Some(2));
        assert_eq!(list[0].preview(), DELETED_PREVIEW);
        assert_eq!(list[1].preview(), EMPTY_GROUP_PREVIEW);
        assert!(list[1].last_message.is_none());
    }

    #[test]
    fn test_sort_pinned_then_newest() {
        let direct = vec![
            msg("m3", "bob", Some("me"), None, 10),
            msg("m2", "carol", Some("me"), None, 20),
            msg("m1", "dave", Some("me"), None, 30),
        ];
        let groups = vec![group("g1", "Empty")];
        let mut list = build_chat_list("me", &direct, &groups, &HashMap::new(), &[], &[]);

        sort_chat_list(&mut list, &["dave".to_string()]);
        let order: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["dave", "bob", "carol", "g1"]);
    }

    #[test]
    fn test_empty_inputs() {
        let list = build_chat_list("me", &[], &[], &HashMap::new(), &[], &[]);
        assert!(list.is_empty());
    }
}
