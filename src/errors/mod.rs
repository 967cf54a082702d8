//! Error types for the delivery client.
//!
//! Every failure is an [`SmtpError`] carrying a kind, an optional SMTP
//! status code, and the underlying cause. Classification into transient
//! and permanent failures drives the retry policy.

use std::fmt;
use thiserror::Error;

/// Result type for delivery operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset.
    ConnectionReset,
    /// Connect timed out.
    ConnectTimeout,
    /// Read timed out.
    ReadTimeout,
    /// Write timed out.
    WriteTimeout,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS not supported by server.
    StarttlsNotSupported,

    // Authentication errors
    /// Credentials were rejected.
    CredentialsInvalid,

    // Protocol errors
    /// Response could not be parsed.
    InvalidResponse,
    /// Server replied with an unexpected status code.
    UnexpectedResponse,

    // Message errors
    /// Sender or recipient address failed validation.
    InvalidAddress,
    /// Subject is missing.
    InvalidSubject,
    /// Neither text nor HTML body is present.
    EmptyBody,
    /// Custom header name or value is malformed.
    InvalidHeader,

    // Pool errors
    /// Pool has been closed.
    PoolClosed,
    /// No connection became available within the wait window.
    AcquireTimeout,
    /// Connection failed its liveness probe.
    ConnectionUnhealthy,

    // Orchestration errors
    /// Configuration is invalid.
    ConfigurationInvalid,
    /// Operation was cancelled by the caller.
    Cancelled,
    /// Permanent server failure, retrying aborted.
    PermanentFailure,
    /// Retry budget exhausted.
    RetriesExhausted,
    /// One or more sends in a bulk operation failed.
    BulkSendFailed,

    /// Unknown or internal error.
    Unknown,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            SmtpErrorKind::ConnectionReset => write!(f, "Connection reset"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            SmtpErrorKind::ReadTimeout => write!(f, "Read timeout"),
            SmtpErrorKind::WriteTimeout => write!(f, "Write timeout"),
            SmtpErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            SmtpErrorKind::InvalidAddress => write!(f, "Invalid address"),
            SmtpErrorKind::InvalidSubject => write!(f, "Invalid subject"),
            SmtpErrorKind::EmptyBody => write!(f, "Empty body"),
            SmtpErrorKind::InvalidHeader => write!(f, "Invalid header"),
            SmtpErrorKind::PoolClosed => write!(f, "Pool is closed"),
            SmtpErrorKind::AcquireTimeout => write!(f, "Pool acquire timeout"),
            SmtpErrorKind::ConnectionUnhealthy => write!(f, "Connection unhealthy"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Cancelled => write!(f, "Operation cancelled"),
            SmtpErrorKind::PermanentFailure => write!(f, "Permanent failure"),
            SmtpErrorKind::RetriesExhausted => write!(f, "Retries exhausted"),
            SmtpErrorKind::BulkSendFailed => write!(f, "Bulk send failed"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to resolve on its own; safe to retry.
    Transient,
    /// Will not resolve by retrying; surface immediately.
    Permanent,
}

/// Transient text indicators, scanned when no structured code is available.
const TRANSIENT_INDICATORS: &[&str] = &[
    "421",
    "450",
    "451",
    "452",
    "timeout",
    "connection refused",
    "connection reset",
    "temporary failure",
];

/// Permanent text indicators (SMTP 550-554).
const PERMANENT_INDICATORS: &[&str] = &["550", "551", "552", "553", "554"];

/// Delivery error with structured classification data.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Classifies this error as transient or permanent.
    ///
    /// The structured SMTP code wins when present. Otherwise the message
    /// text (including the cause chain) is scanned for transient indicators
    /// first, then permanent ones. Unrecognized failures default to
    /// transient so unknown problems are retried rather than dropped.
    pub fn class(&self) -> ErrorClass {
        if let Some(code) = self.smtp_code {
            return match code {
                421 | 450 | 451 | 452 => ErrorClass::Transient,
                550..=554 => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            };
        }

        match self.kind {
            SmtpErrorKind::PermanentFailure
            | SmtpErrorKind::Cancelled
            | SmtpErrorKind::ConfigurationInvalid
            | SmtpErrorKind::InvalidAddress
            | SmtpErrorKind::InvalidSubject
            | SmtpErrorKind::EmptyBody
            | SmtpErrorKind::InvalidHeader
            // A closed pool never reopens; retrying cannot help.
            | SmtpErrorKind::PoolClosed => return ErrorClass::Permanent,
            _ => {}
        }

        let text = self.full_text();
        if TRANSIENT_INDICATORS.iter().any(|ind| text.contains(ind)) {
            return ErrorClass::Transient;
        }
        if PERMANENT_INDICATORS.iter().any(|ind| text.contains(ind)) {
            return ErrorClass::Permanent;
        }
        ErrorClass::Transient
    }

    /// Message text joined with the cause chain, lowercased for matching.
    fn full_text(&self) -> String {
        let mut text = format!("{} {}", self.kind, self.message);
        let mut source: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|c| c as _);
        while let Some(err) = source {
            text.push(' ');
            text.push_str(&err.to_string());
            source = err.source();
        }
        text.to_lowercase()
    }

    // Convenience constructors

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error of the given flavor.
    pub fn timeout(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a validation error for the email model.
    pub fn validation(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a pool error.
    pub fn pool(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(SmtpErrorKind::Cancelled, "operation cancelled by caller")
    }

    /// Wraps a failure that was classified as permanent during retry.
    pub fn permanent(attempt: u32, max_attempts: u32, cause: SmtpError) -> Self {
        Self::new(
            SmtpErrorKind::PermanentFailure,
            format!("permanent error (attempt {}/{})", attempt, max_attempts),
        )
        .with_cause(cause)
    }

    /// Wraps the last failure after the retry budget ran out.
    pub fn retries_exhausted(attempts: u32, cause: SmtpError) -> Self {
        Self::new(
            SmtpErrorKind::RetriesExhausted,
            format!("max attempts reached ({})", attempts),
        )
        .with_cause(cause)
    }

    /// Aggregates a bulk send outcome; `first` is a representative cause.
    pub fn bulk(failed: usize, total: usize, first: SmtpError) -> Self {
        Self::new(
            SmtpErrorKind::BulkSendFailed,
            format!("failed to send {} out of {} emails", failed, total),
        )
        .with_cause(first)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            530 | 535 => SmtpErrorKind::CredentialsInvalid,
            _ => SmtpErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        Ok(())
    }
}
