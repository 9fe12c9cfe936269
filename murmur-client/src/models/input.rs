//! Input DTOs with garde validation for session actions.
//!
//! These structs validate user-supplied data before it reaches the store.

use garde::Validate;
use serde::Deserialize;

use super::message::MessageType;
use crate::error::ChatError;

/// Validation constants
const MAX_ID_LENGTH: usize = 128;
const MAX_TEXT_LENGTH: usize = 10000;
const MAX_GROUP_NAME_LENGTH: usize = 100;
const MIN_PASSWORD_LENGTH: usize = 6;

fn content_fits(kind: &MessageType) -> impl FnOnce(&String, &()) -> garde::Result + '_ {
    move |value, _| match kind {
        MessageType::Text if value.chars().count() > MAX_TEXT_LENGTH => Err(garde::Error::new(
            format!("Message too long (max {} characters)", MAX_TEXT_LENGTH),
        )),
        MessageType::Image if !value.starts_with("data:image/") => {
            Err(garde::Error::new("Image must be a data URL"))
        }
        _ => Ok(()),
    }
}

/// Input for sending a message to the selected chat
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1), custom(content_fits(&self.message_type)))]
    pub content: String,
    #[garde(skip)]
    pub message_type: MessageType,
}

/// Input for creating a group
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct CreateGroupInput {
    #[garde(length(chars, min = 1, max = MAX_GROUP_NAME_LENGTH))]
    pub name: String,
    #[garde(length(min = 1), inner(length(min = 1, max = MAX_ID_LENGTH)))]
    pub members: Vec<String>,
}

/// Email and password for sign-in and sign-up
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct Credentials {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = MIN_PASSWORD_LENGTH))]
    pub password: String,
}

/// Helper trait to convert garde validation errors into `ChatError`
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), ChatError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), ChatError> {
        self.validate().map_err(|e| ChatError::Validation(e.to_string()))
    }
}
