//! Chat synchronization: keeps the local view consistent with the store
//! through full re-fetches plus the row change feed.

mod chat_list;
mod events;
mod receipts;
mod state;

pub use chat_list::{build_chat_list, member_counts, peer_ids, sort_chat_list};
pub use events::{Notice, NoticeLevel, SessionEvent};
pub use receipts::{
    direct_delivery_ids, direct_read_ids, group_delivery_patches, group_read_patches,
    unread_counts, DEFAULT_MEMBER_COUNT,
};
pub use state::SessionState;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthSession;
use crate::error::{ChatError, Result};
use crate::media::compress_image;
use crate::models::input::{CreateGroupInput, SendMessageInput, ValidateExt};
use crate::models::{
    ChatEntry, Group, GroupMember, Message, MessageInfo, MessagePatch, MessageStatus,
    MessageTarget, MessageType, NewGroup, NewMessage, Profile, ProfilePatch, ReceiptEntry,
};
use crate::store::{ChangeEvent, ChangeKind, ChatStore};
use state::toggle_membership;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One signed-in user's chat session.
///
/// Cloning is cheap and every clone drives the same state. The lock on the
/// state is never held across a store call.
#[derive(Clone)]
pub struct ChatSession {
    store: Arc<dyn ChatStore>,
    user_id: String,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    /// Shutdown signal broadcaster
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatSession {
    /// Load the profile, users, chat list and unread counters.
    ///
    /// A missing profile row means empty pin and block lists.
    pub async fn start(store: Arc<dyn ChatStore>, auth: &AuthSession) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut initial = SessionState::new(auth.user_id.clone(), auth.email.clone());
        if let Some(profile) = store.get_profile(&auth.user_id).await? {
            initial.pinned = profile.pinned_users;
            initial.blocked = profile.blocked_users;
        }

        let session = Self {
            store,
            user_id: auth.user_id.clone(),
            state: Arc::new(RwLock::new(initial)),
            events,
            shutdown_tx,
        };

        session.fetch_users().await?;
        session.refresh_chat_list().await?;
        session.fetch_unread_counts().await?;

        info!(user_id = %session.user_id, "Chat session started");
        Ok(session)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, notice: Notice) {
        self.emit(SessionEvent::Notice(notice));
    }

    /// Publish failures as error notices and hand the result back.
    fn surface<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(error = %e, "Chat action failed");
            self.notify(Notice::error(e.to_string()));
        }
        result
    }

    /// Write `last_seen = now` immediately and then on every tick.
    pub fn spawn_presence(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Presence heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let patch = ProfilePatch {
                            last_seen: Some(Utc::now()),
                            ..Default::default()
                        };
                        if let Err(e) = store.update_profile(&user_id, &patch).await {
                            warn!(error = %e, "Failed to update presence");
                        }
                    }
                }
            }
        })
    }

    /// Apply the store's change feed until shutdown.
    pub fn spawn_sync(&self) -> JoinHandle<()> {
        let session = self.clone();
        let mut changes = self.store.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Change feed listener stopped");
                        break;
                    }
                    change = changes.recv() => match change {
                        Ok(event) => {
                            if let Err(e) = session.apply_change(event).await {
                                let _ = session.surface::<()>(Err(e));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Change feed lagged, resyncing");
                            // Buffered events predate the resync and would count twice
                            changes = changes.resubscribe();
                            if let Err(e) = session.resync().await {
                                let _ = session.surface::<()>(Err(e));
                            }
                        }
                        Err(RecvError::Closed) => {
                            info!("Change feed closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Re-derive everything from the store.
    pub async fn resync(&self) -> Result<()> {
        self.refresh_chat_list().await?;
        self.fetch_unread_counts().await?;
        if let Some(chat) = self.state.read().await.selected.clone() {
            self.load_messages(&chat).await?;
        }
        Ok(())
    }

    pub async fn fetch_users(&self) -> Result<()> {
        let mut users = self.store.list_profiles().await?;
        users.sort_by(|a, b| a.display_name().cmp(b.display_name()));
        self.state.write().await.users = users;
        self.emit(SessionEvent::UsersChanged);
        Ok(())
    }

    /// Rebuild the chat list and mark what reached me as delivered.
    pub async fn refresh_chat_list(&self) -> Result<()> {
        let me = self.user_id.as_str();

        let direct = self.store.direct_messages_for(me).await?;
        let groups = self.store.groups_of(me).await?;
        let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        let members = self.store.members_of(&group_ids).await?;
        let group_messages = self.store.group_messages(&group_ids).await?;
        let peers = peer_ids(me, &direct);
        let profiles = self.store.profiles_by_ids(&peers).await?;

        let counts = member_counts(&members);
        let mut entries = build_chat_list(me, &direct, &groups, &counts, &group_messages, &profiles);

        {
            let mut state = self.state.write().await;
            entries.retain(|c| !state.hidden_chats.contains(&c.id));
            sort_chat_list(&mut entries, &state.pinned);

            if let Some(selected) = state.selected.as_mut() {
                if let Some(fresh) = entries.iter().find(|c| c.id == selected.id) {
                    *selected = fresh.clone();
                }
            }
            state.chat_list = entries;
            state.my_groups = group_ids.iter().cloned().collect();
        }
        self.emit(SessionEvent::ChatListChanged);

        // Guarded on `sent` so a concurrent read receipt is never downgraded
        let mut delivered = direct_delivery_ids(me, &direct);
        for (message_id, patch) in group_delivery_patches(me, &group_messages) {
            self.store.update_message(&message_id, &patch).await?;
            delivered.push(message_id);
        }
        if !delivered.is_empty() {
            debug!(count = delivered.len(), "Marking messages delivered");
            self.store
                .update_messages_with_status(
                    &delivered,
                    MessageStatus::Sent,
                    &MessagePatch::status(MessageStatus::Delivered),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn fetch_unread_counts(&self) -> Result<()> {
        let me = self.user_id.as_str();
        let direct = self.store.direct_messages_for(me).await?;
        let group_ids: Vec<String> = self
            .store
            .groups_of(me)
            .await?
            .into_iter()
            .map(|g| g.id)
            .collect();
        let group_messages = self.store.group_messages(&group_ids).await?;

        let mut counts = unread_counts(me, &direct, &group_messages);
        {
            let mut state = self.state.write().await;
            if let Some(open) = state.selected_id() {
                counts.remove(open);
            }
            state.unread = counts;
        }
        self.emit(SessionEvent::UnreadChanged);
        Ok(())
    }

    /// Open a chat from the list, or a direct chat with any known user.
    pub async fn select_chat(&self, chat_id: &str) -> Result<()> {
        self.surface(self.try_select_chat(chat_id).await)
    }

    async fn try_select_chat(&self, chat_id: &str) -> Result<()> {
        let chat = {
            let state = self.state.read().await;
            state
                .chat_list
                .iter()
                .find(|c| c.id == chat_id)
                .cloned()
                .or_else(|| {
                    state
                        .users
                        .iter()
                        .find(|p| p.id == chat_id && p.id != self.user_id)
                        .map(|p| ChatEntry::direct(&p.id, Some(p), None))
                })
        };
        let chat = match chat {
            Some(chat) => chat,
            None => self
                .find_my_group(chat_id)
                .await?
                .ok_or_else(|| ChatError::NotFound(format!("chat {}", chat_id)))?,
        };

        {
            let mut state = self.state.write().await;
            state.hidden_chats.remove(&chat.id);
            state.selected = Some(chat.clone());
            state.messages.clear();
            state.unread.remove(&chat.id);
        }
        self.emit(SessionEvent::UnreadChanged);
        self.load_messages(&chat).await
    }

    /// A group I belong to that is missing from the chat list (e.g. removed).
    async fn find_my_group(&self, group_id: &str) -> Result<Option<ChatEntry>> {
        let Some(group) = self
            .store
            .groups_of(&self.user_id)
            .await?
            .into_iter()
            .find(|g| g.id == group_id)
        else {
            return Ok(None);
        };
        let members = self.store.members_of(&[group.id.clone()]).await?;
        Ok(Some(ChatEntry::group(&group, members.len(), None)))
    }

    pub async fn close_chat(&self) {
        {
            let mut state = self.state.write().await;
            state.selected = None;
            state.messages.clear();
        }
        self.emit(SessionEvent::MessagesChanged);
    }

    async fn load_messages(&self, chat: &ChatEntry) -> Result<()> {
        let me = self.user_id.as_str();
        let thread = if chat.is_group {
            self.store.group_thread(&chat.id).await?
        } else {
            self.store.conversation(me, &chat.id).await?
        };
        let mut visible: Vec<Message> = thread.into_iter().filter(|m| m.is_visible_to(me)).collect();
        self.annotate_senders(&mut visible).await?;

        {
            let mut state = self.state.write().await;
            if state.selected_id() != Some(chat.id.as_str()) {
                debug!(chat_id = %chat.id, "Chat changed while loading, dropping result");
                return Ok(());
            }
            state.messages = visible.clone();
        }
        self.emit(SessionEvent::MessagesChanged);

        self.mark_read(chat, &visible).await
    }

    async fn mark_read(&self, chat: &ChatEntry, messages: &[Message]) -> Result<()> {
        let me = self.user_id.as_str();
        if chat.is_group {
            for (message_id, patch) in group_read_patches(me, messages, chat.member_count) {
                self.store.update_message(&message_id, &patch).await?;
            }
        } else {
            let ids = direct_read_ids(me, messages);
            if !ids.is_empty() {
                self.store
                    .update_messages(&ids, &MessagePatch::status(MessageStatus::Read))
                    .await?;
            }
        }
        Ok(())
    }

    /// Fill `sender_email` from known users, fetching unknown senders once.
    async fn annotate_senders(&self, messages: &mut [Message]) -> Result<()> {
        let missing: Vec<String> = {
            let state = self.state.read().await;
            let mut seen = HashSet::new();
            messages
                .iter()
                .filter(|m| state.email_of(&m.sender_id).is_none())
                .filter(|m| seen.insert(m.sender_id.clone()))
                .map(|m| m.sender_id.clone())
                .collect()
        };
        let fetched: Vec<Profile> = if missing.is_empty() {
            Vec::new()
        } else {
            self.store.profiles_by_ids(&missing).await?
        };

        let state = self.state.read().await;
        for message in messages.iter_mut() {
            message.sender_email = state.email_of(&message.sender_id).or_else(|| {
                fetched
                    .iter()
                    .find(|p| p.id == message.sender_id)
                    .and_then(|p| p.email.clone())
            });
        }
        Ok(())
    }

    /// React to one row change on `messages`.
    pub async fn apply_change(&self, event: ChangeEvent) -> Result<()> {
        let me = self.user_id.clone();

        if let Some(record) = &event.record {
            let (selected, blocked) = {
                let state = self.state.read().await;
                (state.selected.clone(), state.is_blocked(&record.sender_id))
            };

            if let Some(chat) = selected.as_ref() {
                if relates_to(record, &me, chat) && !blocked {
                    self.apply_to_open_chat(&event.kind, record, chat).await?;
                }
            }

            if event.kind == ChangeKind::Insert {
                let mut state = self.state.write().await;
                let open = state.selected_id().map(String::from);
                if let Some(chat_id) = record.chat_id_for(&me) {
                    state.hidden_chats.remove(chat_id);
                }
                if record.receiver_id.as_deref() == Some(me.as_str())
                    && open.as_deref() != Some(record.sender_id.as_str())
                {
                    state.bump_unread(&record.sender_id);
                    drop(state);
                    self.emit(SessionEvent::UnreadChanged);
                } else if let Some(group_id) = &record.group_id {
                    if record.sender_id != me
                        && open.as_deref() != Some(group_id.as_str())
                        && state.my_groups.contains(group_id)
                    {
                        state.bump_unread(group_id);
                        drop(state);
                        self.emit(SessionEvent::UnreadChanged);
                    }
                }
            }
        }

        self.refresh_chat_list().await
    }

    async fn apply_to_open_chat(&self, kind: &ChangeKind, record: &Message, chat: &ChatEntry) -> Result<()> {
        let me = self.user_id.as_str();
        match kind {
            ChangeKind::Insert => {
                let mut incoming = vec![record.clone()];
                self.annotate_senders(&mut incoming).await?;
                {
                    let mut state = self.state.write().await;
                    if state.messages.iter().any(|m| m.id == record.id) {
                        return Ok(());
                    }
                    state.messages.extend(incoming);
                }
                self.emit(SessionEvent::MessagesChanged);

                if record.sender_id != me {
                    self.mark_read(chat, std::slice::from_ref(record)).await?;
                }
            }
            ChangeKind::Update => {
                {
                    let mut state = self.state.write().await;
                    if !record.is_visible_to(me) {
                        state.messages.retain(|m| m.id != record.id);
                    } else if let Some(existing) = state.messages.iter_mut().find(|m| m.id == record.id) {
                        let sender_email = existing.sender_email.take();
                        *existing = record.clone();
                        existing.sender_email = sender_email;
                    }
                }
                self.emit(SessionEvent::MessagesChanged);
            }
            ChangeKind::Delete => {}
        }
        Ok(())
    }

    /// Send to the open chat. Blank content or no open chat does nothing.
    pub async fn send_message(&self, content: &str, message_type: MessageType) -> Result<Option<Message>> {
        self.surface(self.try_send_message(content, message_type).await)
    }

    async fn try_send_message(&self, content: &str, message_type: MessageType) -> Result<Option<Message>> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let Some(chat) = self.state.read().await.selected.clone() else {
            return Ok(None);
        };
        SendMessageInput {
            content: content.to_string(),
            message_type,
        }
        .validate_input()?;

        let target = if chat.is_group {
            MessageTarget::Group(chat.id.clone())
        } else {
            MessageTarget::Direct(chat.id.clone())
        };
        let sent = self
            .store
            .insert_message(&NewMessage {
                content: content.to_string(),
                sender_id: self.user_id.clone(),
                target,
                message_type,
            })
            .await?;
        debug!(message_id = %sent.id, chat_id = %chat.id, "Message sent");

        self.refresh_chat_list().await?;
        Ok(Some(sent))
    }

    /// Compress an image attachment and send it to the open chat.
    pub async fn send_image(&self, bytes: &[u8]) -> Result<Option<Message>> {
        let data_url = self.surface(compress_image(bytes))?;
        self.send_message(&data_url, MessageType::Image).await
    }

    /// Create a group with me as admin. Blank name or no members does nothing.
    pub async fn create_group(&self, name: &str, members: &[String]) -> Result<Option<Group>> {
        self.surface(self.try_create_group(name, members).await)
    }

    async fn try_create_group(&self, name: &str, members: &[String]) -> Result<Option<Group>> {
        let mut invited: Vec<String> = Vec::new();
        for id in members {
            if id != &self.user_id && !invited.contains(id) {
                invited.push(id.clone());
            }
        }
        if name.trim().is_empty() || invited.is_empty() {
            return Ok(None);
        }
        CreateGroupInput {
            name: name.trim().to_string(),
            members: invited.clone(),
        }
        .validate_input()?;

        let group = self
            .store
            .create_group(&NewGroup {
                name: name.trim().to_string(),
                created_by: self.user_id.clone(),
            })
            .await?;

        let rows: Vec<GroupMember> = std::iter::once(self.user_id.clone())
            .chain(invited)
            .map(|user_id| GroupMember {
                group_id: group.id.clone(),
                is_admin: user_id == self.user_id,
                user_id,
            })
            .collect();
        self.store.add_members(&rows).await?;

        info!(group_id = %group.id, members = rows.len(), "Group created");
        self.notify(Notice::success("Group created"));
        self.refresh_chat_list().await?;
        Ok(Some(group))
    }

    /// Pin or unpin a chat. Returns whether it is now pinned.
    pub async fn toggle_pin(&self, chat_id: &str) -> Result<bool> {
        self.surface(self.try_toggle_pin(chat_id).await)
    }

    async fn try_toggle_pin(&self, chat_id: &str) -> Result<bool> {
        let (pinned_now, list) = {
            let mut state = self.state.write().await;
            let added = toggle_membership(&mut state.pinned, chat_id);
            (added, state.pinned.clone())
        };
        let patch = ProfilePatch {
            pinned_users: Some(list),
            ..Default::default()
        };
        self.store.update_profile(&self.user_id, &patch).await?;
        self.refresh_chat_list().await?;
        Ok(pinned_now)
    }

    /// Block or unblock a user. Returns whether they are now blocked.
    pub async fn toggle_block(&self, user_id: &str) -> Result<bool> {
        self.surface(self.try_toggle_block(user_id).await)
    }

    async fn try_toggle_block(&self, user_id: &str) -> Result<bool> {
        let (blocked_now, list) = {
            let mut state = self.state.write().await;
            if state.my_groups.contains(user_id) {
                return Err(ChatError::Forbidden("groups cannot be blocked".to_string()));
            }
            let added = toggle_membership(&mut state.blocked, user_id);
            (added, state.blocked.clone())
        };
        let patch = ProfilePatch {
            blocked_users: Some(list),
            ..Default::default()
        };
        self.store.update_profile(&self.user_id, &patch).await?;

        self.notify(Notice::success(if blocked_now { "Blocked" } else { "Unblocked" }));
        self.refresh_chat_list().await?;
        Ok(blocked_now)
    }

    fn actionable(state: &SessionState, message_id: &str) -> Result<Message> {
        let message = state
            .find_message(message_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if message.is_deleted {
            return Err(ChatError::Forbidden("message is already deleted".to_string()));
        }
        Ok(message)
    }

    /// Hide a message from my own view only.
    pub async fn delete_for_me(&self, message_id: &str) -> Result<()> {
        self.surface(self.try_delete_for_me(message_id).await)
    }

    async fn try_delete_for_me(&self, message_id: &str) -> Result<()> {
        let message = Self::actionable(&*self.state.read().await, message_id)?;
        let mut deleted_for = message.deleted_for.clone();
        if !deleted_for.contains(&self.user_id) {
            deleted_for.push(self.user_id.clone());
        }
        let patch = MessagePatch {
            deleted_for: Some(deleted_for),
            ..Default::default()
        };
        self.store.update_message(message_id, &patch).await?;

        self.state.write().await.messages.retain(|m| m.id != message_id);
        self.emit(SessionEvent::MessagesChanged);
        self.notify(Notice::success("Deleted"));
        Ok(())
    }

    /// Replace my message with the deleted placeholder for everyone.
    pub async fn delete_for_everyone(&self, message_id: &str) -> Result<()> {
        self.surface(self.try_delete_for_everyone(message_id).await)
    }

    async fn try_delete_for_everyone(&self, message_id: &str) -> Result<()> {
        let message = Self::actionable(&*self.state.read().await, message_id)?;
        if message.sender_id != self.user_id {
            return Err(ChatError::Forbidden(
                "only the sender can delete for everyone".to_string(),
            ));
        }
        let patch = MessagePatch {
            is_deleted: Some(true),
            ..Default::default()
        };
        self.store.update_message(message_id, &patch).await?;

        {
            let mut state = self.state.write().await;
            if let Some(local) = state.messages.iter_mut().find(|m| m.id == message_id) {
                patch.apply(local);
            }
        }
        self.emit(SessionEvent::MessagesChanged);
        self.notify(Notice::success("Deleted for everyone"));
        Ok(())
    }

    /// Drop a chat from the list until new activity arrives for it.
    pub async fn remove_chat(&self, chat_id: &str) -> Result<()> {
        let was_open = {
            let mut state = self.state.write().await;
            if !state.chat_list.iter().any(|c| c.id == chat_id) {
                drop(state);
                return self.surface(Err(ChatError::NotFound(format!("chat {}", chat_id))));
            }
            state.hidden_chats.insert(chat_id.to_string());
            state.chat_list.retain(|c| c.id != chat_id);
            state.selected_id() == Some(chat_id)
        };
        if was_open {
            self.close_chat().await;
        }
        self.emit(SessionEvent::ChatListChanged);
        self.notify(Notice::success("Chat removed"));
        Ok(())
    }

    /// Receipts for one of my own messages in the open group.
    pub async fn message_info(&self, message_id: &str) -> Result<MessageInfo> {
        self.surface(self.try_message_info(message_id).await)
    }

    async fn try_message_info(&self, message_id: &str) -> Result<MessageInfo> {
        let (message, known) = {
            let state = self.state.read().await;
            let chat = state.selected.as_ref().ok_or(ChatError::NoChatSelected)?;
            if !chat.is_group {
                return Err(ChatError::Forbidden(
                    "message info is only available in groups".to_string(),
                ));
            }
            let message = Self::actionable(&state, message_id)?;
            if message.sender_id != self.user_id {
                return Err(ChatError::Forbidden(
                    "message info is only available for your own messages".to_string(),
                ));
            }
            (message, state.users.clone())
        };

        let pending: Vec<String> = message
            .delivered_to
            .iter()
            .filter(|id| !message.read_by.contains(id))
            .cloned()
            .collect();
        let unknown: Vec<String> = message
            .read_by
            .iter()
            .chain(pending.iter())
            .filter(|id| !known.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        let mut profiles = known;
        if !unknown.is_empty() {
            profiles.extend(self.store.profiles_by_ids(&unknown).await?);
        }

        let entry = |id: &String| ReceiptEntry {
            user_id: id.clone(),
            email: profiles.iter().find(|p| &p.id == id).and_then(|p| p.email.clone()),
        };
        Ok(MessageInfo {
            message_id: message.id.clone(),
            read_by: message.read_by.iter().map(entry).collect(),
            delivered_to: pending.iter().map(entry).collect(),
        })
    }

    /// Stop background tasks. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn sign_out(&self) {
        info!(user_id = %self.user_id, "Signing out");
        self.shutdown();
        self.close_chat().await;
        self.emit(SessionEvent::SignedOut);
    }
}

/// Whether a changed row belongs to the open chat and involves me.
fn relates_to(record: &Message, user_id: &str, chat: &ChatEntry) -> bool {
    if chat.is_group {
        record.belongs_to(&chat.id, true)
    } else {
        record.belongs_to(&chat.id, false) && record.peer_of(user_id) == Some(chat.id.as_str())
            && (record.sender_id == user_id || record.receiver_id.as_deref() == Some(user_id))
    }
}
