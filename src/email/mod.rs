//! The email model.
//!
//! An [`Email`] is the unit of work for the delivery pipeline. It is
//! assembled through [`EmailBuilder`], which validates exactly once on
//! `build()`; an invalid email is never observable by the send pipeline.
//! The pipeline mutates delivery state (status, attempts, last error)
//! in place as the email moves through `pending -> sending -> {sent | failed}`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Email priority. Normal emits no priority headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Low priority (X-Priority: 5).
    Low,
    /// Normal priority.
    #[default]
    Normal,
    /// High priority (X-Priority: 1).
    High,
}

/// Delivery status of an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Created, not yet handed to the pipeline.
    #[default]
    Pending,
    /// A send is in progress.
    Sending,
    /// A failed attempt is waiting for its backoff to elapse.
    Retrying,
    /// Accepted by the server.
    Sent,
    /// Gave up; `last_error` holds the cause.
    Failed,
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailStatus::Pending => write!(f, "pending"),
            EmailStatus::Sending => write!(f, "sending"),
            EmailStatus::Retrying => write!(f, "retrying"),
            EmailStatus::Sent => write!(f, "sent"),
            EmailStatus::Failed => write!(f, "failed"),
        }
    }
}

/// File attachment. Immutable once attached.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Filename presented to the recipient.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Opaque binary payload.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment with the content type guessed from the filename.
    pub fn from_file(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self::new(filename, content_type, data)
    }
}

/// A structured email message plus its delivery state.
#[derive(Debug, Clone)]
pub struct Email {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// Sender address.
    pub from: String,
    /// Primary recipients, order preserved for header rendering.
    pub to: Vec<String>,
    /// CC recipients.
    pub cc: Vec<String>,
    /// BCC recipients (never rendered into headers).
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text_body: Option<String>,
    /// HTML body.
    pub html_body: Option<String>,
    /// Attachments, in the order they were added.
    pub attachments: Vec<Attachment>,
    /// Custom headers, keys unique.
    pub headers: HashMap<String, String>,
    /// Priority.
    pub priority: Priority,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Delivery status, mutated by the pipeline.
    pub status: EmailStatus,
    /// Number of send attempts so far.
    pub attempts: u32,
    /// Text of the last error, if any.
    pub last_error: Option<String>,
}

impl Email {
    /// Creates a new email builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// Returns all recipients (to + cc + bcc) in envelope order.
    pub fn all_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }

    /// Returns the count of all recipients.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Returns true if the email has any attachments.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Checks the model invariants. The builder runs this on `build()`;
    /// the service runs it again as its gate before sending.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.from.is_empty() {
            return Err(SmtpError::validation(
                SmtpErrorKind::InvalidAddress,
                "from address is required",
            ));
        }
        if !is_valid_address(&self.from) {
            return Err(SmtpError::validation(
                SmtpErrorKind::InvalidAddress,
                format!("invalid from address: {}", self.from),
            ));
        }
        if self.to.is_empty() {
            return Err(SmtpError::validation(
                SmtpErrorKind::InvalidAddress,
                "at least one recipient is required",
            ));
        }
        for addr in self.all_recipients() {
            if !is_valid_address(addr) {
                return Err(SmtpError::validation(
                    SmtpErrorKind::InvalidAddress,
                    format!("invalid recipient address: {}", addr),
                ));
            }
        }
        if self.subject.is_empty() {
            return Err(SmtpError::validation(
                SmtpErrorKind::InvalidSubject,
                "subject is required",
            ));
        }
        let text_empty = self.text_body.as_deref().unwrap_or("").is_empty();
        let html_empty = self.html_body.as_deref().unwrap_or("").is_empty();
        if text_empty && html_empty {
            return Err(SmtpError::validation(
                SmtpErrorKind::EmptyBody,
                "at least one body (text or HTML) is required",
            ));
        }
        for (name, value) in &self.headers {
            if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':') {
                return Err(SmtpError::validation(
                    SmtpErrorKind::InvalidHeader,
                    format!("invalid header name: {}", name),
                ));
            }
            if value.contains('\r') || value.contains('\n') {
                return Err(SmtpError::validation(
                    SmtpErrorKind::InvalidHeader,
                    format!("header value contains line break: {}", name),
                ));
            }
        }
        Ok(())
    }
}

/// Validates an address against a simplified RFC 5322 grammar:
/// `local@domain.tld` where local is `[A-Za-z0-9._%+-]+`, domain labels
/// are alphanumeric/hyphen/dot, and the final label is at least two
/// alphabetic characters.
pub fn is_valid_address(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((name, tld)) => {
            !name.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

/// Fluent builder for [`Email`]. Accumulates fields and validates
/// exactly once in [`EmailBuilder::build`].
#[derive(Debug, Default)]
pub struct EmailBuilder {
    from: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    text_body: Option<String>,
    html_body: Option<String>,
    attachments: Vec<Attachment>,
    headers: HashMap<String, String>,
    priority: Priority,
}

impl EmailBuilder {
    /// Sets the sender address.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    /// Adds a primary recipient.
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    /// Adds multiple primary recipients.
    pub fn to_many<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, cc: impl Into<String>) -> Self {
        self.cc.push(cc.into());
        self
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc.push(bcc.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the plain text body.
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    /// Sets the HTML body.
    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds an attachment from raw parts.
    pub fn attach(
        self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachment(Attachment::new(filename, content_type, data))
    }

    /// Sets a custom header. Keys are unique; setting twice overwrites.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Validates and builds the email.
    pub fn build(self) -> SmtpResult<Email> {
        let email = Email {
            id: Uuid::new_v4(),
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            text_body: self.text_body,
            html_body: self.html_body,
            attachments: self.attachments,
            headers: self.headers,
            priority: self.priority,
            created_at: Utc::now(),
            status: EmailStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        email.validate()?;
        Ok(email)
    }
}
