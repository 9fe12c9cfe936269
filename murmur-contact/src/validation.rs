use garde::Validate;
use serde::Deserialize;

use crate::error::AppError;

pub const MAX_NAME_LENGTH: usize = 100;
pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MIN_SUBJECT_LENGTH: usize = 3;
pub const MAX_SUBJECT_LENGTH: usize = 200;
pub const MAX_MESSAGE_LENGTH: usize = 5000;

/// Body of `POST /api/contact`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct ContactForm {
    #[garde(length(chars, min = 2, max = MAX_NAME_LENGTH))]
    pub name: String,
    #[garde(email, length(max = MAX_EMAIL_LENGTH))]
    pub email: String,
    /// Optional; an empty string counts as absent.
    #[serde(default)]
    #[garde(custom(subject_length))]
    pub subject: Option<String>,
    #[garde(length(chars, min = 10, max = MAX_MESSAGE_LENGTH))]
    pub message: String,
}

fn subject_length(value: &Option<String>, _: &()) -> garde::Result {
    let Some(subject) = value.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    match subject.chars().count() {
        n if n < MIN_SUBJECT_LENGTH => Err(garde::Error::new(format!(
            "subject must be at least {} characters",
            MIN_SUBJECT_LENGTH
        ))),
        n if n > MAX_SUBJECT_LENGTH => Err(garde::Error::new(format!(
            "subject must be at most {} characters",
            MAX_SUBJECT_LENGTH
        ))),
        _ => Ok(()),
    }
}

impl ContactForm {
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()
            .map_err(|report| AppError::Validation(format!("Invalid form: {}", report)))
    }

    /// Subject text when one was supplied.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(name: &str, email: &str, subject: Option<&str>, message: &str) -> ContactForm {
        ContactForm {
            name: name.to_string(),
            email: email.to_string(),
            subject: subject.map(String::from),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_valid_form() {
        let ok = form("Ada", "ada@example.com", Some("Hello there"), "I would like to talk.");
        assert!(ok.check().is_ok());
        assert_eq!(ok.subject(), Some("Hello there"));
    }

    #[test]
    fn test_subject_optional_or_empty() {
        assert!(form("Ada", "ada@example.com", None, "I would like to talk.").check().is_ok());

        let empty = form("Ada", "ada@example.com", Some(""), "I would like to talk.");
        assert!(empty.check().is_ok());
        assert_eq!(empty.subject(), None);

        assert!(form("Ada", "ada@example.com", Some("Hi"), "I would like to talk.")
            .check()
            .is_err());
    }

    #[test]
    fn test_field_minimums() {
        assert!(form("A", "ada@example.com", None, "I would like to talk.").check().is_err());
        assert!(form("Ada", "not-an-email", None, "I would like to talk.").check().is_err());
        assert!(form("Ada", "ada@example.com", None, "too short").check().is_err());
    }

    #[test]
    fn test_report_names_the_field() {
        let err = form("Ada", "ada@example.com", None, "short").check().unwrap_err();
        assert!(matches!(&err, AppError::Validation(msg) if msg.contains("message")));
    }

    #[test]
    fn test_missing_subject_deserializes() {
        let parsed: ContactForm = serde_json::from_str(
            r#"{"name":"Ada","email":"ada@example.com","message":"I would like to talk."}"#,
        )
        .unwrap();
        assert!(parsed.subject.is_none());
    }
}
