//! Transport layer: a single live SMTP session.
//!
//! [`SmtpConnection::establish`] performs the whole session setup: TCP
//! dial, TLS (implicit on port 465, STARTTLS otherwise) and AUTH PLAIN.
//! A connection handed out by the pool is therefore always ready for a
//! mail transaction.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};

/// Command/response surface of an established session, as the mail
/// transaction sees it.
#[async_trait::async_trait]
pub trait SmtpSession: Send {
    /// Sends one command and reads the reply.
    async fn command(&mut self, command: SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Writes raw bytes without reading a reply.
    async fn send_raw(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads one full reply.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;
}

#[async_trait::async_trait]
impl SmtpSession for SmtpConnection {
    async fn command(&mut self, command: SmtpCommand) -> SmtpResult<SmtpResponse> {
        SmtpConnection::command(self, command).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        SmtpConnection::send_raw(self, data).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        SmtpConnection::read_response(self).await
    }
}

/// Stream type, plain TCP or TLS. `Closed` is the placeholder left
/// behind while the stream is being upgraded or after shutdown.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    Closed,
}

/// A live, authenticated SMTP session.
pub struct SmtpConnection {
    stream: TransportStream,
    command_timeout: Duration,
    tls_enabled: bool,
    host: String,
}

impl fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .finish()
    }
}

impl SmtpConnection {
    /// Dials the server and runs the full setup sequence. On success the
    /// connection is TLS-protected and authenticated.
    pub async fn establish(config: &SmtpConfig) -> SmtpResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                SmtpError::timeout(
                    SmtpErrorKind::ConnectTimeout,
                    format!("connect to {} timed out", address),
                )
            })?
            .map_err(|e| map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut conn = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: config.command_timeout,
            tls_enabled: false,
            host: config.host.clone(),
        };

        // Implicit TLS wraps the stream before the server greets.
        if config.implicit_tls() {
            conn.upgrade_tls(config.connect_timeout).await?;
        }

        let greeting = conn.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error());
        }
        debug!(host = %conn.host, tls = conn.tls_enabled, "connected");

        let ehlo = conn.expect_success(SmtpCommand::Ehlo(config.client_id().to_string())).await?;

        if !conn.tls_enabled {
            if !ehlo.advertises("STARTTLS") {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    format!("{} does not advertise STARTTLS", conn.host),
                ));
            }
            let response = conn.command(SmtpCommand::StartTls).await?;
            if response.code != codes::SERVICE_READY {
                return Err(response.to_error());
            }
            conn.upgrade_tls(config.connect_timeout).await?;

            // The session state resets after STARTTLS; greet again.
            conn.expect_success(SmtpCommand::Ehlo(config.client_id().to_string()))
                .await?;
        }

        conn.authenticate(config).await?;

        Ok(conn)
    }

    /// Authenticates with AUTH PLAIN, sending the credentials as the
    /// initial response.
    async fn authenticate(&mut self, config: &SmtpConfig) -> SmtpResult<()> {
        let password = config
            .password
            .as_ref()
            .ok_or_else(|| SmtpError::configuration("password is required"))?;

        let initial = plain_credentials(&config.username, password.expose_secret());
        let response = self
            .command(SmtpCommand::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some(initial),
            })
            .await?;

        if response.code != codes::AUTH_SUCCESS {
            return Err(SmtpError::authentication(format!(
                "authentication rejected: {}",
                response
            ))
            .with_smtp_code(response.code));
        }
        debug!(host = %self.host, username = %config.username, "authenticated");
        Ok(())
    }

    /// Sends one command and reads the reply.
    pub async fn command(&mut self, command: SmtpCommand) -> SmtpResult<SmtpResponse> {
        debug!(command = %command, "sending");
        let line = format!("{}\r\n", command.to_smtp_string());
        self.send_raw(line.as_bytes()).await?;
        let response = self.read_response().await?;
        debug!(code = response.code, "received");
        Ok(response)
    }

    /// Sends a command and requires a 2xx reply.
    pub async fn expect_success(&mut self, command: SmtpCommand) -> SmtpResult<SmtpResponse> {
        let response = self.command(command).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        Ok(response)
    }

    /// Writes raw bytes, for the DATA payload.
    pub async fn send_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout_duration = self.command_timeout;
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                write_all(stream.get_mut(), data, timeout_duration).await
            }
            TransportStream::Tls(stream) => {
                write_all(stream.get_mut(), data, timeout_duration).await
            }
            TransportStream::Closed => Err(closed_error()),
        }
    }

    /// Reads one full (possibly multiline) response.
    pub async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let timeout_duration = self.command_timeout;
        match &mut self.stream {
            TransportStream::Plain(stream) => read_response_inner(stream, timeout_duration).await,
            TransportStream::Tls(stream) => read_response_inner(stream, timeout_duration).await,
            TransportStream::Closed => Err(closed_error()),
        }
    }

    /// Liveness probe: NOOP must succeed.
    pub async fn health_check(&mut self) -> SmtpResult<()> {
        let response = self.command(SmtpCommand::Noop).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SmtpError::pool(
                SmtpErrorKind::ConnectionUnhealthy,
                format!("liveness probe failed: {}", response),
            ))
        }
    }

    /// Says QUIT and drops the stream. Safe to call more than once; the
    /// server's goodbye is not waited on beyond one reply.
    pub async fn close(&mut self) {
        if !matches!(self.stream, TransportStream::Closed) {
            let _ = self.command(SmtpCommand::Quit).await;
            self.stream = TransportStream::Closed;
            debug!(host = %self.host, "connection closed");
        }
    }

    /// Returns true when the session runs over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    /// Wraps the plain stream in TLS.
    async fn upgrade_tls(&mut self, handshake_timeout: Duration) -> SmtpResult<()> {
        use rustls::pki_types::ServerName;

        if self.tls_enabled {
            return Ok(());
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| SmtpError::tls(format!("invalid server name: {}", self.host)))?;

        let tcp_stream = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(SmtpError::tls("stream is not plaintext"));
            }
        };

        let tls_stream = timeout(handshake_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| {
                SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out")
            })?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

        self.stream = TransportStream::Tls(BufReader::new(tls_stream));
        self.tls_enabled = true;
        Ok(())
    }
}

/// Encodes AUTH PLAIN credentials: BASE64 of `\0username\0password`.
fn plain_credentials(username: &str, password: &str) -> String {
    let raw = format!("\0{}\0{}", username, password);
    BASE64.encode(raw.as_bytes())
}

fn closed_error() -> SmtpError {
    SmtpError::new(SmtpErrorKind::ConnectionReset, "connection is closed")
}

fn map_io_error(error: io::Error, address: &str) -> SmtpError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => SmtpError::new(
            SmtpErrorKind::ConnectionRefused,
            format!("connection refused by {}", address),
        ),
        io::ErrorKind::TimedOut => SmtpError::timeout(
            SmtpErrorKind::ConnectTimeout,
            format!("connect to {} timed out", address),
        ),
        io::ErrorKind::ConnectionReset => {
            SmtpError::new(SmtpErrorKind::ConnectionReset, "connection reset by server")
        }
        _ => SmtpError::connection(format!("connection error: {}", error)).with_cause(error),
    }
}

/// Reads lines until the final (non-continuation) line of a reply.
async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    timeout_duration: Duration,
) -> SmtpResult<SmtpResponse> {
    let mut lines = Vec::new();

    loop {
        let mut line = String::new();

        let read = timeout(timeout_duration, reader.read_line(&mut line))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "read timed out"))?
            .map_err(|e| SmtpError::protocol(format!("read error: {}", e)))?;

        if read == 0 {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "server closed connection",
            ));
        }

        let line = line.trim_end().to_string();
        let is_continuation = line.len() >= 4 && line.as_bytes()[3] == b'-';
        lines.push(line);

        if !is_continuation {
            break;
        }
    }

    SmtpResponse::parse(&lines)
}

async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    timeout_duration: Duration,
) -> SmtpResult<()> {
    timeout(timeout_duration, writer.write_all(data))
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "write timed out"))?
        .map_err(|e| SmtpError::protocol(format!("write error: {}", e)))?;

    timeout(timeout_duration, writer.flush())
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "flush timed out"))?
        .map_err(|e| SmtpError::protocol(format!("flush error: {}", e)))?;

    Ok(())
}
