use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{ChangeEvent, ChatStore};
use crate::auth::AuthSession;
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::models::{
    Group, GroupMember, Message, MessagePatch, MessageStatus, NewGroup, NewMessage, Profile,
    ProfilePatch,
};
use crate::realtime::RealtimeClient;

const REQUEST_TIMEOUT_SECS: u64 = 10;

type Query = Vec<(&'static str, String)>;

/// Hosted table API adapter. Row changes arrive through the realtime client.
pub struct RemoteStore {
    http: reqwest::Client,
    rest_url: String,
    anon_key: String,
    access_token: String,
    realtime: RealtimeClient,
}

impl RemoteStore {
    pub fn new(config: &ClientConfig, session: &AuthSession) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let realtime = RealtimeClient::new(config.websocket_url()?, session.access_token.clone());
        Ok(Self {
            http,
            rest_url: config.rest_url(),
            anon_key: config.anon_key.clone(),
            access_token: session.access_token.clone(),
            realtime,
        })
    }

    /// Build the store and start the change feed.
    pub fn connect(config: &ClientConfig, session: &AuthSession) -> Result<Self> {
        let store = Self::new(config, session)?;
        store.realtime.connect();
        Ok(store)
    }

    pub fn shutdown(&self) {
        self.realtime.shutdown();
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.access_token)
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, query: Query) -> Result<Vec<T>> {
        debug!(table, "Selecting rows");
        let response = self.request(Method::GET, table).query(&query).send().await?;
        let body = checked(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<Vec<T>> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let body = checked(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn patch<B: Serialize>(&self, table: &str, query: Query, body: &B) -> Result<()> {
        let response = self
            .request(Method::PATCH, table)
            .query(&query)
            .json(body)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for RemoteStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let rows: Vec<Profile> = self
            .select("profiles", vec![("select", "*".into()), ("id", eq(user_id))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.select("profiles", vec![("select", "*".into())]).await
    }

    async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select("profiles", vec![("select", "*".into()), ("id", in_list(ids))])
            .await
    }

    async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> Result<()> {
        self.patch("profiles", vec![("id", eq(user_id))], patch).await
    }

    async fn direct_messages_for(&self, user_id: &str) -> Result<Vec<Message>> {
        self.select(
            "messages",
            vec![
                ("select", "*".into()),
                ("or", format!("(sender_id.eq.{0},receiver_id.eq.{0})", user_id)),
                ("group_id", "is.null".into()),
                ("order", "created_at.desc".into()),
            ],
        )
        .await
    }

    async fn conversation(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>> {
        self.select(
            "messages",
            vec![
                ("select", "*".into()),
                ("or", conversation_filter(user_id, peer_id)),
                ("group_id", "is.null".into()),
                ("order", "created_at.asc".into()),
            ],
        )
        .await
    }

    async fn group_messages(&self, group_ids: &[String]) -> Result<Vec<Message>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(
            "messages",
            vec![
                ("select", "*".into()),
                ("group_id", in_list(group_ids)),
                ("order", "created_at.desc".into()),
            ],
        )
        .await
    }

    async fn group_thread(&self, group_id: &str) -> Result<Vec<Message>> {
        self.select(
            "messages",
            vec![
                ("select", "*".into()),
                ("group_id", eq(group_id)),
                ("order", "created_at.asc".into()),
            ],
        )
        .await
    }

    async fn groups_of(&self, user_id: &str) -> Result<Vec<Group>> {
        let memberships: Vec<GroupMember> = self
            .select(
                "group_members",
                vec![("select", "*".into()), ("user_id", eq(user_id))],
            )
            .await?;
        let ids: Vec<String> = memberships.into_iter().map(|m| m.group_id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select("groups", vec![("select", "*".into()), ("id", in_list(&ids))])
            .await
    }

    async fn members_of(&self, group_ids: &[String]) -> Result<Vec<GroupMember>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(
            "group_members",
            vec![("select", "*".into()), ("group_id", in_list(group_ids))],
        )
        .await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let rows: Vec<Message> = self.insert("messages", &message.row()).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ChatError::Store("Insert returned no row".to_string()))
    }

    async fn update_message(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        self.patch("messages", vec![("id", eq(message_id))], patch).await
    }

    async fn update_messages(&self, message_ids: &[String], patch: &MessagePatch) -> Result<()> {
        if message_ids.is_empty() || patch.is_empty() {
            return Ok(());
        }
        self.patch("messages", vec![("id", in_list(message_ids))], patch)
            .await
    }

    async fn update_messages_with_status(
        &self,
        message_ids: &[String],
        current: MessageStatus,
        patch: &MessagePatch,
    ) -> Result<()> {
        if message_ids.is_empty() || patch.is_empty() {
            return Ok(());
        }
        let query = vec![
            ("id", in_list(message_ids)),
            ("status", eq(current.as_str())),
        ];
        self.patch("messages", query, patch).await
    }

    async fn create_group(&self, group: &NewGroup) -> Result<Group> {
        let rows: Vec<Group> = self.insert("groups", group).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ChatError::Store("Insert returned no row".to_string()))
    }

    async fn add_members(&self, members: &[GroupMember]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let _: Vec<GroupMember> = self.insert("group_members", members).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.realtime.subscribe()
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.realtime.shutdown();
    }
}

async fn checked(response: Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        warn!(status = %status, "Backend request failed");
        let reason = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or(body);
        return Err(ChatError::Store(format!("{}: {}", status, reason)));
    }
    Ok(body)
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

fn in_list(values: &[String]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
    format!("in.({})", quoted.join(","))
}

fn conversation_filter(user_id: &str, peer_id: &str) -> String {
    format!(
        "(and(sender_id.eq.{0},receiver_id.eq.{1}),and(sender_id.eq.{1},receiver_id.eq.{0}))",
        user_id, peer_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        assert_eq!(eq("u1"), "eq.u1");
        assert_eq!(
            in_list(&["a".to_string(), "b".to_string()]),
            r#"in.("a","b")"#
        );
        assert_eq!(
            conversation_filter("u1", "u2"),
            "(and(sender_id.eq.u1,receiver_id.eq.u2),and(sender_id.eq.u2,receiver_id.eq.u1))"
        );
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let config = ClientConfig::new("https://demo.example.co", "anon");
        let session = AuthSession {
            user_id: "u1".to_string(),
            email: None,
            access_token: "token".to_string(),
        };
        let store = RemoteStore::new(&config, &session).unwrap();
        assert!(!store.realtime.is_connected().await);
        assert_eq!(store.rest_url, "https://demo.example.co/rest/v1");
    }
}
