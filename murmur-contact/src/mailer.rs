use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::error::AppError;
use crate::validation::ContactForm;

/// A rendered contact mail, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEmail {
    pub from: String,
    pub to: String,
    pub reply_to: String,
    pub subject: String,
    pub html: String,
}

impl ContactEmail {
    /// Mail from the admin mailbox to itself, replying to the submitter.
    pub fn compose(form: &ContactForm, admin: &str) -> Self {
        let subject = match form.subject() {
            Some(subject) => format!("New contact form message: {}", subject),
            None => format!("New contact form message: {}", form.name),
        };

        let subject_row = form
            .subject()
            .map(|s| format!("<p><strong>Subject:</strong> {}</p>\n", escape_html(s)))
            .unwrap_or_default();

        let html = format!(
            "<div style=\"font-family: Arial, sans-serif; max-width: 600px; padding: 20px;\">\n\
             <h2>New contact form message</h2>\n\
             <p><strong>Name:</strong> {name}</p>\n\
             <p><strong>Email:</strong> {email}</p>\n\
             {subject_row}\
             <hr>\n\
             <p style=\"white-space: pre-wrap;\">{message}</p>\n\
             </div>",
            name = escape_html(&form.name),
            email = escape_html(&form.email),
            subject_row = subject_row,
            message = escape_html(&form.message),
        );

        Self {
            from: admin.to_string(),
            to: admin.to_string(),
            reply_to: form.email.clone(),
            subject,
            html,
        }
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &ContactEmail) -> Result<(), AppError>;
}

/// Delivers through an authenticated SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(host: &str, user: &str, pass: &str) -> Result<Self, AppError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| AppError::Config(format!("Invalid SMTP host {}: {}", host, e)))?
            .credentials(Credentials::new(user.to_string(), pass.to_string()))
            .build();
        Ok(Self { transport })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, AppError> {
    address
        .parse()
        .map_err(|e| AppError::Mail(format!("Invalid address {}: {}", address, e)))
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &ContactEmail) -> Result<(), AppError> {
        let message = Message::builder()
            .from(mailbox(&email.from)?)
            .to(mailbox(&email.to)?)
            .reply_to(mailbox(&email.reply_to)?)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())
            .map_err(|e| AppError::Mail(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Mail(e.to_string()))?;

        info!(reply_to = %email.reply_to, "Contact mail sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(subject: Option<&str>) -> ContactForm {
        ContactForm {
            name: "Ada <script>".to_string(),
            email: "ada@example.com".to_string(),
            subject: subject.map(String::from),
            message: "Tom & Jerry say \"hi\"".to_string(),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_compose_addresses() {
        let email = ContactEmail::compose(&form(None), "admin@murmur.dev");
        assert_eq!(email.from, "admin@murmur.dev");
        assert_eq!(email.to, "admin@murmur.dev");
        assert_eq!(email.reply_to, "ada@example.com");
        assert_eq!(email.subject, "New contact form message: Ada <script>");
    }

    #[test]
    fn test_compose_escapes_body() {
        let email = ContactEmail::compose(&form(Some("Pricing")), "admin@murmur.dev");
        assert_eq!(email.subject, "New contact form message: Pricing");
        assert!(email.html.contains("Ada &lt;script&gt;"));
        assert!(email.html.contains("Tom &amp; Jerry say &quot;hi&quot;"));
        assert!(email.html.contains("<strong>Subject:</strong> Pricing"));
        assert!(!email.html.contains("<script>"));
    }

    #[test]
    fn test_compose_without_subject_omits_row() {
        let email = ContactEmail::compose(&form(Some("")), "admin@murmur.dev");
        assert!(!email.html.contains("Subject:"));
    }
}
