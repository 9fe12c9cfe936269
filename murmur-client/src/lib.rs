//! Murmur chat client library
//!
//! Session synchronization engine plus the store, auth and realtime adapters
//! it runs on. The `murmur` binary is a thin terminal front end over it.

pub mod auth;
pub mod config;
pub mod error;
pub mod media;
pub mod models;
pub mod realtime;
pub mod session;
pub mod store;
pub mod utils;

pub use auth::{AuthClient, AuthSession};
pub use config::ClientConfig;
pub use error::{ChatError, Result};
pub use session::{ChatSession, Notice, NoticeLevel, SessionEvent, SessionState};
pub use store::{ChangeEvent, ChangeKind, ChatStore, RemoteStore, SqliteStore};
