//! Pooled SMTP delivery client.
//!
//! The crate is organized in layers:
//!
//! - [`email`]: the [`Email`] model and its builder.
//! - [`message`]: RFC 5322 / MIME wire rendering.
//! - [`protocol`] and [`transport`]: SMTP commands, responses and live
//!   TLS-protected, authenticated sessions.
//! - [`pool`]: a bounded pool of ready sessions.
//! - [`retry`]: exponential backoff with transient/permanent
//!   classification.
//! - [`client`]: one mail transaction per checkout, bulk fan-out
//!   bounded by the pool.
//! - [`service`]: validation gate, retrying, delivery state tracking.
//!
//! # Example
//!
//! ```no_run
//! use mailpool::{Email, EmailSender, EmailService, RetryConfig, RetryPolicy, SmtpClient, SmtpConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> mailpool::SmtpResult<()> {
//! let config = SmtpConfig::builder()
//!     .host("smtp.example.com")
//!     .port(587)
//!     .credentials("sender@example.com", "app-password")
//!     .pool_size(5)
//!     .build()?;
//!
//! let client = SmtpClient::connect(config).await?;
//! let service = EmailService::new(client, RetryPolicy::new(RetryConfig::default()));
//!
//! let mut email = Email::builder()
//!     .from("sender@example.com")
//!     .to("recipient@example.com")
//!     .subject("Hello")
//!     .text_body("Hello from mailpool!")
//!     .build()?;
//!
//! service.send_email(&CancellationToken::new(), &mut email).await?;
//! service.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod email;
pub mod errors;
pub mod message;
pub mod mocks;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod service;
pub mod transport;

pub use client::{Client, SmtpClient};
pub use config::{SmtpConfig, SmtpConfigBuilder};
pub use email::{Attachment, Email, EmailBuilder, EmailStatus, Priority};
pub use errors::{ErrorClass, SmtpError, SmtpErrorKind, SmtpResult};
pub use message::MessageBuilder;
pub use pool::{ConnectionManager, Pool, SmtpConnectionManager, SmtpPool};
pub use retry::{RetryConfig, RetryPolicy};
pub use service::{EmailRepository, EmailSender, EmailService};
pub use transport::{SmtpConnection, SmtpSession};
