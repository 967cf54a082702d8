//! SMTP client orchestration.
//!
//! [`Client`] ties the pool, the message builder and the wire protocol
//! together: check a session out, run one mail transaction over it, put
//! it back. Bulk sends fan out concurrently but never wider than the
//! pool, so the pool size is the delivery parallelism knob.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SmtpConfig;
use crate::email::Email;
use crate::errors::{SmtpError, SmtpResult};
use crate::message::MessageBuilder;
use crate::pool::{ConnectionManager, Pool, SmtpConnectionManager};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::transport::SmtpSession;

/// Delivery client over a pool of sessions built by `M`.
pub struct Client<M: ConnectionManager>
where
    M::Connection: SmtpSession,
{
    pool: Arc<Pool<M>>,
    builder: MessageBuilder,
}

/// Client over real pooled SMTP connections.
pub type SmtpClient = Client<SmtpConnectionManager>;

impl SmtpClient {
    /// Validates the configuration and brings up the full pool. Fails if
    /// any connection cannot be established.
    pub async fn connect(config: SmtpConfig) -> SmtpResult<Self> {
        config.validate()?;

        let builder = MessageBuilder::new(config.host.clone());
        let pool_size = config.pool_size;
        let acquire_timeout = config.acquire_timeout;
        let pool = Pool::new(
            SmtpConnectionManager::new(config),
            pool_size,
            acquire_timeout,
        )
        .await?;

        Ok(Self::with_pool(pool, builder))
    }
}

impl<M: ConnectionManager> Client<M>
where
    M::Connection: SmtpSession,
{
    /// Builds a client over an existing pool.
    pub fn with_pool(pool: Arc<Pool<M>>, builder: MessageBuilder) -> Self {
        Self { pool, builder }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &Arc<Pool<M>> {
        &self.pool
    }

    /// Sends one email: checks a session out, runs the transaction,
    /// resets the session with RSET and returns it to the pool.
    /// Sessions that cannot be reset are discarded so the pool replaces
    /// them lazily.
    pub async fn send(&self, cancel: &CancellationToken, email: &Email) -> SmtpResult<()> {
        let mut conn = self.pool.get(cancel).await?;

        let result = self.transact(&mut conn, email).await;
        match &result {
            Ok(()) => {
                debug!(email_id = %email.id, recipients = email.recipient_count(), "delivered")
            }
            Err(err) => warn!(email_id = %email.id, error = %err, "transaction failed"),
        }

        // Reset the session state after every transaction; a session
        // that cannot be reset is discarded and replaced lazily.
        match conn.command(SmtpCommand::Rset).await {
            Ok(response) if response.is_success() => self.pool.put(conn).await,
            _ => self.pool.discard(conn).await,
        }

        result
    }

    /// Sends many emails concurrently, at most pool-width at a time.
    ///
    /// Every email is attempted; failures do not stop the batch. If any
    /// send failed the result is an aggregate error naming the failure
    /// count and carrying the first failure as its cause.
    pub async fn send_bulk(&self, cancel: &CancellationToken, emails: &[Email]) -> SmtpResult<()> {
        let total = emails.len();
        let mut failures: Vec<(usize, SmtpError)> = stream::iter(emails.iter().enumerate())
            .map(|(index, email)| async move {
                (index, self.send(cancel, email).await)
            })
            .buffer_unordered(self.pool.capacity())
            .filter_map(|(index, result)| async move {
                result.err().map(|err| (index, err))
            })
            .collect()
            .await;

        if failures.is_empty() {
            return Ok(());
        }

        failures.sort_by_key(|(index, _)| *index);
        let failed = failures.len();
        let (_, first) = failures.remove(0);
        Err(SmtpError::bulk(failed, total, first))
    }

    /// Closes the pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs one mail transaction: MAIL FROM, RCPT TO for every envelope
    /// recipient (BCC included), DATA, payload, final accept.
    async fn transact(&self, conn: &mut M::Connection, email: &Email) -> SmtpResult<()> {
        let message = self.builder.build(email);

        let response = conn
            .command(SmtpCommand::MailFrom {
                address: email.from.clone(),
            })
            .await?;
        require_success(response)?;

        for recipient in email.all_recipients() {
            let response = conn
                .command(SmtpCommand::RcptTo {
                    address: recipient.to_string(),
                })
                .await?;
            require_success(response)?;
        }

        let response = conn.command(SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error());
        }

        conn.send_raw(&MessageBuilder::prepare_data(&message)).await?;

        let response = conn.read_response().await?;
        require_success(response)?;
        Ok(())
    }
}

fn require_success(response: SmtpResponse) -> SmtpResult<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(response.to_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::mocks::{test_email, test_email_to, MemoryManager};
    use std::time::Duration;

    async fn client(manager: MemoryManager) -> Client<MemoryManager> {
        let pool = Pool::new(manager, 2, Duration::from_secs(5)).await.unwrap();
        Client::with_pool(pool, MessageBuilder::new("example.com"))
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn send_runs_a_full_transaction() {
        let manager = MemoryManager::new();
        let log = manager.command_log();
        let payloads = manager.payloads();
        let client = client(manager).await;

        let mut email = test_email();
        email.bcc = vec!["hidden@example.com".to_string()];
        client.send(&token(), &email).await.unwrap();

        let commands = log.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "MAIL FROM:<sender@example.com>",
                "RCPT TO:<recipient@example.com>",
                "RCPT TO:<hidden@example.com>",
                "DATA",
                "RSET",
            ]
        );

        let payloads = payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].ends_with(b"\r\n.\r\n"));

        // Session went back to the pool
        assert_eq!(client.pool().idle_count(), 2);
    }

    #[tokio::test]
    async fn rejected_recipient_fails_and_resets_the_session() {
        let manager = MemoryManager::new();
        let log = manager.command_log();
        let client = client(manager).await;

        let email = test_email_to("reject@example.com");
        let err = client.send(&token(), &email).await.unwrap_err();
        assert_eq!(err.smtp_code(), Some(550));

        let commands = log.lock().unwrap().clone();
        assert_eq!(commands.last().map(String::as_str), Some("RSET"));
        assert_eq!(client.pool().idle_count(), 2);
    }

    #[tokio::test]
    async fn bulk_reports_failures_without_stopping() {
        let client = client(MemoryManager::new()).await;

        let emails = vec![
            test_email(),
            test_email_to("reject@example.com"),
            test_email(),
            test_email_to("reject2@example.com"),
            test_email(),
        ];

        let err = client.send_bulk(&token(), &emails).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::BulkSendFailed);
        assert!(err.message().contains("failed to send 2 out of 5 emails"));
    }

    #[tokio::test]
    async fn bulk_with_no_failures_is_ok() {
        let client = client(MemoryManager::new()).await;
        let emails = vec![test_email(), test_email(), test_email()];
        client.send_bulk(&token(), &emails).await.unwrap();
    }

    #[tokio::test]
    async fn pre_cancelled_send_never_touches_the_wire() {
        let manager = MemoryManager::new();
        let log = manager.command_log();
        let client = client(manager).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.send(&cancel, &test_email()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Cancelled);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_after_close_reports_pool_closed() {
        let client = client(MemoryManager::new()).await;
        client.close().await;

        let err = client.send(&token(), &test_email()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);
    }
}
