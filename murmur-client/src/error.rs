use thiserror::Error;

/// Errors surfaced by the chat engine and its store adapters.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("No chat selected")]
    NoChatSelected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
