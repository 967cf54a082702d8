//! Test doubles.
//!
//! [`MemoryManager`] builds in-memory sessions that answer the wire
//! protocol without a network, for exercising the pool, client and
//! service. [`MockSender`] is a scripted [`EmailSender`] for testing
//! code that sits above the service layer.
//!
//! Session behavior hooks: recipients containing `reject` get a 550,
//! and [`MemoryManager::fail_next_transactions`] makes the next N
//! MAIL FROM commands fail with a 451.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::email::{Email, EmailStatus};
use crate::errors::{SmtpError, SmtpResult};
use crate::pool::ConnectionManager;
use crate::protocol::{SmtpCommand, SmtpResponse};
use crate::service::EmailSender;
use crate::transport::SmtpSession;

/// A valid single-recipient email for tests.
pub fn test_email() -> Email {
    test_email_to("recipient@example.com")
}

/// A valid email addressed to the given recipient.
pub fn test_email_to(recipient: &str) -> Email {
    Email::builder()
        .from("sender@example.com")
        .to(recipient)
        .subject("Test message")
        .text_body("Hello from the test suite.")
        .build()
        .unwrap()
}

/// In-memory SMTP session. Answers 250 to everything except the
/// behavior hooks described at the module level.
pub struct MemorySession {
    commands: Arc<Mutex<Vec<String>>>,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_transactions: Arc<AtomicUsize>,
}

#[async_trait]
impl SmtpSession for MemorySession {
    async fn command(&mut self, command: SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.commands
            .lock()
            .unwrap()
            .push(command.to_smtp_string());

        let response = match &command {
            SmtpCommand::MailFrom { .. } => {
                let failing = self
                    .fail_transactions
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    SmtpResponse {
                        code: 451,
                        message: vec!["temporary failure, try again".to_string()],
                    }
                } else {
                    ok_response()
                }
            }
            SmtpCommand::RcptTo { address } if address.contains("reject") => SmtpResponse {
                code: 550,
                message: vec!["mailbox unavailable".to_string()],
            },
            SmtpCommand::Data => SmtpResponse {
                code: 354,
                message: vec!["start mail input".to_string()],
            },
            _ => ok_response(),
        };
        Ok(response)
    }

    async fn send_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.payloads.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        Ok(ok_response())
    }
}

fn ok_response() -> SmtpResponse {
    SmtpResponse {
        code: 250,
        message: vec!["ok".to_string()],
    }
}

/// Builds [`MemorySession`]s that share one command log and payload
/// store, so a test can inspect everything that crossed the pool.
pub struct MemoryManager {
    commands: Arc<Mutex<Vec<String>>>,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_transactions: Arc<AtomicUsize>,
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl MemoryManager {
    /// Creates a manager with clean logs.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            payloads: Arc::new(Mutex::new(Vec::new())),
            fail_transactions: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
        }
    }

    /// Commands sent over any session, in wire format.
    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }

    /// Raw DATA payloads sent over any session.
    pub fn payloads(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.payloads.clone()
    }

    /// Makes the next `n` MAIL FROM commands fail with a 451.
    pub fn fail_next_transactions(&self, n: usize) {
        self.fail_transactions.store(n, Ordering::SeqCst);
    }

    /// Number of sessions created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of sessions disposed.
    pub fn disposed_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionManager for MemoryManager {
    type Connection = MemorySession;

    async fn create(&self) -> SmtpResult<MemorySession> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            commands: self.commands.clone(),
            payloads: self.payloads.clone(),
            fail_transactions: self.fail_transactions.clone(),
        })
    }

    async fn check(&self, _conn: &mut MemorySession) -> SmtpResult<()> {
        Ok(())
    }

    async fn dispose(&self, _conn: MemorySession) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted sender. Each send pops the next scripted result, defaulting
/// to success, and updates the email the way the real service would.
#[derive(Default)]
pub struct MockSender {
    results: Mutex<VecDeque<SmtpResult<()>>>,
    sent: Mutex<Vec<Uuid>>,
}

impl MockSender {
    /// Creates a sender that succeeds on every send.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome for an upcoming send.
    pub fn push_result(&self, result: SmtpResult<()>) {
        self.results.lock().unwrap().push_back(result);
    }

    /// Ids of the emails handed to this sender, in order.
    pub fn sent_ids(&self) -> Vec<Uuid> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for MockSender {
    async fn send_email(&self, _cancel: &CancellationToken, email: &mut Email) -> SmtpResult<()> {
        self.sent.lock().unwrap().push(email.id);
        let result = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));

        email.attempts += 1;
        match result {
            Ok(()) => {
                email.status = EmailStatus::Sent;
                email.last_error = None;
                Ok(())
            }
            Err(err) => {
                email.status = EmailStatus::Failed;
                email.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn send_bulk_emails(
        &self,
        cancel: &CancellationToken,
        emails: &mut [Email],
    ) -> SmtpResult<()> {
        let total = emails.len();
        let mut first_error: Option<SmtpError> = None;
        let mut failed = 0usize;

        for email in emails.iter_mut() {
            if let Err(err) = self.send_email(cancel, email).await {
                failed += 1;
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(first) => Err(SmtpError::bulk(failed, total, first)),
        }
    }

    async fn close(&self) {}
}
