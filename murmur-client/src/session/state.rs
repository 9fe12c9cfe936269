use std::collections::{HashMap, HashSet};

use crate::models::{ChatEntry, Message, Profile};

/// Local view of the signed-in user's chats.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub user_id: String,
    pub email: Option<String>,
    /// All known profiles, shown by email
    pub users: Vec<Profile>,
    pub chat_list: Vec<ChatEntry>,
    pub selected: Option<ChatEntry>,
    /// Visible messages of the selected chat, oldest first
    pub messages: Vec<Message>,
    /// chat id -> unread count
    pub unread: HashMap<String, usize>,
    pub pinned: Vec<String>,
    pub blocked: Vec<String>,
    /// Chats removed from the list until they see new activity
    pub hidden_chats: HashSet<String>,
    pub my_groups: HashSet<String>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email,
            ..Default::default()
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.id.as_str())
    }

    pub fn email_of(&self, user_id: &str) -> Option<String> {
        self.users
            .iter()
            .find(|p| p.id == user_id)
            .and_then(|p| p.email.clone())
    }

    pub fn is_pinned(&self, chat_id: &str) -> bool {
        self.pinned.iter().any(|id| id == chat_id)
    }

    pub fn is_blocked(&self, user_id: &str) -> bool {
        self.blocked.iter().any(|id| id == user_id)
    }

    pub fn unread_for(&self, chat_id: &str) -> usize {
        self.unread.get(chat_id).copied().unwrap_or(0)
    }

    pub fn bump_unread(&mut self, chat_id: &str) {
        *self.unread.entry(chat_id.to_string()).or_insert(0) += 1;
    }

    pub fn find_message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }
}

/// Flip membership of `id` in `list`. Returns true when it was added.
pub fn toggle_membership(list: &mut Vec<String>, id: &str) -> bool {
    if let Some(pos) = list.iter().position(|x| x == id) {
        list.remove(pos);
        false
    } else {
        list.push(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_membership() {
        let mut list = vec!["a".to_string()];
        assert!(toggle_membership(&mut list, "b"));
        assert_eq!(list, vec!["a".to_string(), "b".to_string()]);
        assert!(!toggle_membership(&mut list, "a"));
        assert_eq!(list, vec!["b".to_string()]);
    }

    #[test]
    fn test_unread_bump() {
        let mut state = SessionState::new("me", None);
        assert_eq!(state.unread_for("u2"), 0);
        state.bump_unread("u2");
        state.bump_unread("u2");
        assert_eq!(state.unread_for("u2"), 2);
    }

    #[test]
    fn test_email_lookup() {
        let mut state = SessionState::new("me", None);
        state.users.push(Profile::new("u2", "bob@example.com"));
        assert_eq!(state.email_of("u2").as_deref(), Some("bob@example.com"));
        assert!(state.email_of("u3").is_none());
    }
}
