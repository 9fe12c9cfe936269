use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeEvent, ChatStore, CHANGE_FEED_CAPACITY};
use crate::error::{ChatError, Result};
use crate::models::{
    Group, GroupMember, Message, MessagePatch, MessageStatus, NewGroup, NewMessage, Profile,
    ProfilePatch,
};

const MESSAGE_COLUMNS: &str = "id, content, sender_id, receiver_id, group_id, created_at, \
     status, message_type, read_by, delivered_to, is_deleted, deleted_for";

const PROFILE_COLUMNS: &str = "id, email, last_seen, pinned_users, blocked_users";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        email TEXT,
        last_seen TEXT,
        pinned_users TEXT NOT NULL DEFAULT '[]',
        blocked_users TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS groups (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        avatar_url TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS group_members (
        group_id TEXT REFERENCES groups(id),
        user_id TEXT NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (group_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        receiver_id TEXT,
        group_id TEXT REFERENCES groups(id),
        created_at TEXT NOT NULL,
        status TEXT CHECK(status IN ('sent', 'delivered', 'read')) NOT NULL DEFAULT 'sent',
        message_type TEXT CHECK(message_type IN ('text', 'image')) NOT NULL DEFAULT 'text',
        read_by TEXT NOT NULL DEFAULT '[]',
        delivered_to TEXT NOT NULL DEFAULT '[]',
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_for TEXT NOT NULL DEFAULT '[]',
        CHECK ((receiver_id IS NULL) <> (group_id IS NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id);
    CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id);
    CREATE INDEX IF NOT EXISTS idx_messages_group ON messages(group_id);
    CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
    CREATE INDEX IF NOT EXISTS idx_group_members_user_id ON group_members(user_id);
";

/// Local SQLite implementation of the hosted tables.
///
/// Every message write is published on the change feed, the same way the
/// hosted realtime service reports it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ChatError::Store(format!("Lock poisoned: {}", e)))
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }

    /// Create or replace a profile row (sign-up creates these on the hosted side).
    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profiles (id, email, last_seen, pinned_users, blocked_users)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                last_seen = excluded.last_seen,
                pinned_users = excluded.pinned_users,
                blocked_users = excluded.blocked_users",
            (
                &profile.id,
                &profile.email,
                profile.last_seen.map(timestamp),
                serde_json::to_string(&profile.pinned_users)?,
                serde_json::to_string(&profile.blocked_users)?,
            ),
        )?;
        Ok(())
    }

    /// Patch rows by id, optionally only those whose status is still `current`.
    fn patch_messages(
        &self,
        message_ids: &[String],
        current: Option<MessageStatus>,
        patch: &MessagePatch,
    ) -> Result<()> {
        if message_ids.is_empty() || patch.is_empty() {
            return Ok(());
        }
        let (columns, values) = patch_assignments(patch)?;
        let mut sql = format!("UPDATE messages SET {} WHERE id = ?", columns.join(", "));
        if current.is_some() {
            sql.push_str(" AND status = ?");
        }

        let updated = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut updated = Vec::with_capacity(message_ids.len());
            for id in message_ids {
                let mut params = values.clone();
                params.push(Value::Text(id.clone()));
                if let Some(status) = current {
                    params.push(Value::Text(status.as_str().to_string()));
                }
                if stmt.execute(params_from_iter(params))? > 0 {
                    if let Some(message) = Self::load_message(&conn, id)? {
                        updated.push(message);
                    }
                }
            }
            updated
        };

        for message in updated {
            self.publish(ChangeEvent::update(message));
        }
        Ok(())
    }

    fn query_messages(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<Message>> {
        let mut stmt = conn.prepare(sql)?;
        let messages = stmt
            .query_map(params_from_iter(params), message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn load_message(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        Ok(conn
            .query_row(&sql, [message_id], message_from_row)
            .optional()?)
    }

    fn query_profiles(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<Profile>> {
        let mut stmt = conn.prepare(sql)?;
        let profiles = stmt
            .query_map(params_from_iter(params), profile_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(profiles)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS);
        Ok(conn.query_row(&sql, [user_id], profile_from_row).optional()?)
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM profiles ORDER BY email", PROFILE_COLUMNS);
        Self::query_profiles(&conn, &sql, Vec::new())
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM profiles WHERE id IN ({})",
            PROFILE_COLUMNS,
            placeholders(ids.len())
        );
        Self::query_profiles(&conn, &sql, text_values(ids))
    }

    async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> Result<()> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        if let Some(last_seen) = patch.last_seen {
            columns.push("last_seen = ?");
            values.push(Value::Text(timestamp(last_seen)));
        }
        if let Some(pinned) = &patch.pinned_users {
            columns.push("pinned_users = ?");
            values.push(Value::Text(serde_json::to_string(pinned)?));
        }
        if let Some(blocked) = &patch.blocked_users {
            columns.push("blocked_users = ?");
            values.push(Value::Text(serde_json::to_string(blocked)?));
        }
        if columns.is_empty() {
            return Ok(());
        }
        values.push(Value::Text(user_id.to_string()));

        let conn = self.lock()?;
        let sql = format!("UPDATE profiles SET {} WHERE id = ?", columns.join(", "));
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    async fn direct_messages_for(&self, user_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM messages
             WHERE group_id IS NULL AND (sender_id = ?1 OR receiver_id = ?1)
             ORDER BY created_at DESC, rowid DESC",
            MESSAGE_COLUMNS
        );
        Self::query_messages(&conn, &sql, vec![Value::Text(user_id.to_string())])
    }

    async fn conversation(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM messages
             WHERE group_id IS NULL
               AND ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
             ORDER BY created_at ASC, rowid ASC",
            MESSAGE_COLUMNS
        );
        Self::query_messages(
            &conn,
            &sql,
            vec![
                Value::Text(user_id.to_string()),
                Value::Text(peer_id.to_string()),
            ],
        )
    }

    async fn group_messages(&self, group_ids: &[String]) -> Result<Vec<Message>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE group_id IN ({})
             ORDER BY created_at DESC, rowid DESC",
            MESSAGE_COLUMNS,
            placeholders(group_ids.len())
        );
        Self::query_messages(&conn, &sql, text_values(group_ids))
    }

    async fn group_thread(&self, group_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE group_id = ?1 ORDER BY created_at ASC, rowid ASC",
            MESSAGE_COLUMNS
        );
        Self::query_messages(&conn, &sql, vec![Value::Text(group_id.to_string())])
    }

    async fn groups_of(&self, user_id: &str) -> Result<Vec<Group>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.avatar_url, g.created_by, g.created_at
             FROM groups g
             JOIN group_members gm ON gm.group_id = g.id
             WHERE gm.user_id = ?1
             ORDER BY g.created_at",
        )?;
        let groups = stmt
            .query_map([user_id], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    avatar_url: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: Some(time_column(row, 4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    async fn members_of(&self, group_ids: &[String]) -> Result<Vec<GroupMember>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT group_id, user_id, is_admin FROM group_members WHERE group_id IN ({})",
            placeholders(group_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let members = stmt
            .query_map(params_from_iter(text_values(group_ids)), |row| {
                Ok(GroupMember {
                    group_id: row.get(0)?,
                    user_id: row.get(1)?,
                    is_admin: row.get::<_, i32>(2)? == 1,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let stored = Message {
            id: uuid::Uuid::new_v4().to_string(),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id().map(String::from),
            group_id: message.group_id().map(String::from),
            created_at: Utc::now(),
            status: Default::default(),
            message_type: message.message_type,
            read_by: Vec::new(),
            delivered_to: Vec::new(),
            is_deleted: false,
            deleted_for: Vec::new(),
            sender_email: None,
        };

        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO messages (id, content, sender_id, receiver_id, group_id, created_at, status, message_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                (
                    &stored.id,
                    &stored.content,
                    &stored.sender_id,
                    &stored.receiver_id,
                    &stored.group_id,
                    timestamp(stored.created_at),
                    stored.status.as_str(),
                    stored.message_type.as_str(),
                ),
            )?;
        }

        debug!(message_id = %stored.id, "Inserted message");
        self.publish(ChangeEvent::insert(stored.clone()));
        Ok(stored)
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        self.update_messages(&[message_id.to_string()], patch).await
    }

    async fn update_messages(&self, message_ids: &[String], patch: &MessagePatch) -> Result<()> {
        self.patch_messages(message_ids, None, patch)
    }

    async fn update_messages_with_status(
        &self,
        message_ids: &[String],
        current: MessageStatus,
        patch: &MessagePatch,
    ) -> Result<()> {
        self.patch_messages(message_ids, Some(current), patch)
    }

    async fn create_group(&self, group: &NewGroup) -> Result<Group> {
        let created = Group {
            id: uuid::Uuid::new_v4().to_string(),
            name: group.name.clone(),
            avatar_url: None,
            created_by: Some(group.created_by.clone()),
            created_at: Some(Utc::now()),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO groups (id, name, created_by, created_at) VALUES (?1, ?2, ?3, ?4)",
            (
                &created.id,
                &created.name,
                &created.created_by,
                created.created_at.map(timestamp),
            ),
        )?;
        Ok(created)
    }

    async fn add_members(&self, members: &[GroupMember]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for member in members {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, is_admin) VALUES (?1, ?2, ?3)",
                (&member.group_id, &member.user_id, member.is_admin as i32),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn text_values(values: &[String]) -> Vec<Value> {
    values.iter().cloned().map(Value::Text).collect()
}

fn patch_assignments(patch: &MessagePatch) -> Result<(Vec<&'static str>, Vec<Value>)> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    if let Some(status) = patch.status {
        columns.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(read_by) = &patch.read_by {
        columns.push("read_by = ?");
        values.push(Value::Text(serde_json::to_string(read_by)?));
    }
    if let Some(delivered_to) = &patch.delivered_to {
        columns.push("delivered_to = ?");
        values.push(Value::Text(serde_json::to_string(delivered_to)?));
    }
    if let Some(is_deleted) = patch.is_deleted {
        columns.push("is_deleted = ?");
        values.push(Value::Integer(is_deleted as i64));
    }
    if let Some(deleted_for) = &patch.deleted_for {
        columns.push("deleted_for = ?");
        values.push(Value::Text(serde_json::to_string(deleted_for)?));
    }
    Ok((columns, values))
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn list_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)),
        None => Ok(Vec::new()),
    }
}

fn enum_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| conversion_error(idx, io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        group_id: row.get(4)?,
        created_at: time_column(row, 5)?,
        status: enum_column(row, 6)?,
        message_type: enum_column(row, 7)?,
        read_by: list_column(row, 8)?,
        delivered_to: list_column(row, 9)?,
        is_deleted: row.get::<_, i32>(10)? == 1,
        deleted_for: list_column(row, 11)?,
        sender_email: None,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let last_seen = match row.get::<_, Option<String>>(2)? {
        Some(_) => Some(time_column(row, 2)?),
        None => None,
    };
    Ok(Profile {
        id: row.get(0)?,
        email: row.get(1)?,
        last_seen,
        pinned_users: list_column(row, 3)?,
        blocked_users: list_column(row, 4)?,
    })
}
