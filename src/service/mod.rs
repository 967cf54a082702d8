//! Email service layer.
//!
//! [`EmailService`] sits between application code and the client: it
//! gates on validation, drives the retry policy, and keeps the email's
//! delivery state (status, attempts, last error) up to date. Bulk sends
//! here are sequential; use [`Client::send_bulk`] for concurrent
//! fan-out without state tracking.
//!
//! [`Client::send_bulk`]: crate::client::Client::send_bulk

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::email::{Email, EmailStatus};
use crate::errors::{SmtpError, SmtpResult};
use crate::pool::ConnectionManager;
use crate::retry::RetryPolicy;
use crate::transport::SmtpSession;

/// Sends emails and records the outcome on the email itself.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Sends one email, retrying transient failures.
    async fn send_email(&self, cancel: &CancellationToken, email: &mut Email) -> SmtpResult<()>;

    /// Sends a batch sequentially. Every email is attempted; the result
    /// aggregates the failures.
    async fn send_bulk_emails(
        &self,
        cancel: &CancellationToken,
        emails: &mut [Email],
    ) -> SmtpResult<()>;

    /// Releases the underlying resources.
    async fn close(&self);
}

/// Storage extension point for queued delivery. No implementation ships
/// with this crate.
#[async_trait]
pub trait EmailRepository: Send + Sync {
    /// Persists an email.
    async fn save(&self, email: &Email) -> SmtpResult<()>;

    /// Loads an email by id.
    async fn find_by_id(&self, id: Uuid) -> SmtpResult<Option<Email>>;

    /// Lists emails still waiting to be sent.
    async fn list_pending(&self) -> SmtpResult<Vec<Email>>;

    /// Updates the delivery status of a stored email.
    async fn update_status(&self, id: Uuid, status: EmailStatus) -> SmtpResult<()>;
}

/// Delivery service over a client and a retry policy.
pub struct EmailService<M: ConnectionManager>
where
    M::Connection: SmtpSession,
{
    client: Client<M>,
    retry: RetryPolicy,
}

impl<M: ConnectionManager> EmailService<M>
where
    M::Connection: SmtpSession,
{
    /// Creates a service. The retry policy is a value; two services can
    /// run different policies against the same server.
    pub fn new(client: Client<M>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

#[async_trait]
impl<M: ConnectionManager> EmailSender for EmailService<M>
where
    M::Connection: SmtpSession,
{
    async fn send_email(&self, cancel: &CancellationToken, email: &mut Email) -> SmtpResult<()> {
        if let Err(err) = email.validate() {
            email.status = EmailStatus::Failed;
            email.last_error = Some(err.to_string());
            return Err(err);
        }

        email.status = EmailStatus::Sending;
        email.attempts = 0;

        // The retry closure works from a snapshot so the failure hook
        // can update the live email between attempts. The counter only
        // moves when an attempt actually executes, so a pre-cancelled
        // send records zero attempts.
        let snapshot = Arc::new(email.clone());
        let attempts_run = AtomicU32::new(0);
        let client = &self.client;
        let result = self
            .retry
            .run(
                cancel,
                |attempt| {
                    attempts_run.store(attempt, Ordering::SeqCst);
                    let snapshot = Arc::clone(&snapshot);
                    let cancel = cancel.clone();
                    async move { client.send(&cancel, &snapshot).await }
                },
                |attempt, err| {
                    email.status = EmailStatus::Retrying;
                    email.attempts = attempt;
                    email.last_error = Some(err.to_string());
                },
            )
            .await;

        email.attempts = attempts_run.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                email.status = EmailStatus::Sent;
                email.last_error = None;
                info!(email_id = %email.id, attempts = email.attempts, "email sent");
                Ok(())
            }
            Err(err) => {
                email.status = EmailStatus::Failed;
                email.last_error = Some(err.to_string());
                warn!(email_id = %email.id, attempts = email.attempts, error = %err, "email failed");
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
            None => {
                debug!(total, "bulk send complete");
                Ok(())
            }
            Some(first) => Err(SmtpError::bulk(failed, total, first)),
        }
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::message::MessageBuilder;
    use crate::mocks::{test_email, test_email_to, MemoryManager};
    use crate::pool::Pool;
    use crate::retry::RetryConfig;
    use std::time::Duration;

    async fn service(manager: MemoryManager) -> EmailService<MemoryManager> {
        let pool = Pool::new(manager, 2, Duration::from_secs(5)).await.unwrap();
        let client = Client::with_pool(pool, MessageBuilder::new("example.com"));
        EmailService::new(client, RetryPolicy::new(RetryConfig::default()))
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn successful_send_marks_sent_after_one_attempt() {
        let service = service(MemoryManager::new()).await;
        let mut email = test_email();

        service.send_email(&token(), &mut email).await.unwrap();
        assert_eq!(email.status, EmailStatus::Sent);
        assert_eq!(email.attempts, 1);
        assert!(email.last_error.is_none());
    }

    #[tokio::test]
    async fn invalid_email_never_reaches_the_wire() {
        let manager = MemoryManager::new();
        let log = manager.command_log();
        let service = service(manager).await;

        let mut email = test_email();
        email.to.clear();

        let err = service.send_email(&token(), &mut email).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidAddress);
        assert_eq!(email.status, EmailStatus::Failed);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let manager = MemoryManager::new();
        manager.fail_next_transactions(2);
        let service = service(manager).await;

        let mut email = test_email();
        service.send_email(&token(), &mut email).await.unwrap();
        assert_eq!(email.status, EmailStatus::Sent);
        assert_eq!(email.attempts, 3);
    }

    #[tokio::test]
    async fn permanent_rejection_fails_after_one_attempt() {
        let service = service(MemoryManager::new()).await;

        let mut email = test_email_to("reject@example.com");
        let err = service.send_email(&token(), &mut email).await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::PermanentFailure);
        assert_eq!(email.status, EmailStatus::Failed);
        assert_eq!(email.attempts, 1);
        assert!(email.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn endless_transient_failures_exhaust_the_budget() {
        let manager = MemoryManager::new();
        manager.fail_next_transactions(usize::MAX);
        let service = service(manager).await;

        let mut email = test_email();
        let err = service.send_email(&token(), &mut email).await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::RetriesExhausted);
        assert!(err.message().contains("max attempts reached (5)"));
        assert_eq!(email.status, EmailStatus::Failed);
        assert_eq!(email.attempts, 5);
    }

    #[tokio::test]
    async fn bulk_send_updates_each_email_and_aggregates_failures() {
        let service = service(MemoryManager::new()).await;

        let mut emails = vec![
            test_email(),
            test_email_to("reject@example.com"),
            test_email(),
            test_email_to("reject2@example.com"),
            test_email(),
        ];

        let err = service
            .send_bulk_emails(&token(), &mut emails)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::BulkSendFailed);
        assert!(err.message().contains("failed to send 2 out of 5 emails"));

        let statuses: Vec<EmailStatus> = emails.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                EmailStatus::Sent,
                EmailStatus::Failed,
                EmailStatus::Sent,
                EmailStatus::Failed,
                EmailStatus::Sent,
            ]
        );
    }

    #[tokio::test]
    async fn pre_cancelled_send_records_no_attempts() {
        let service = service(MemoryManager::new()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut email = test_email();
        let err = service.send_email(&cancel, &mut email).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Cancelled);
        assert_eq!(email.status, EmailStatus::Failed);
        assert_eq!(email.attempts, 0);
    }

    #[tokio::test]
    async fn close_shuts_the_pool_down() {
        let service = service(MemoryManager::new()).await;
        service.close().await;

        let mut email = test_email();
        let err = service.send_email(&token(), &mut email).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
        assert_eq!(email.status, EmailStatus::Failed);
    }
}
