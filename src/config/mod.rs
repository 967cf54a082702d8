//! Configuration for the delivery client.
//!
//! The configuration is resolved by an external loader (environment,
//! file, whatever the embedding application uses) and handed in as a
//! value. Host, username and password are required; everything else
//! has sensible defaults.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Port that implies implicit TLS rather than STARTTLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default wait for a pooled connection to become available.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single command/response exchange.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Delivery client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication username.
    pub username: String,
    /// Authentication password (never serialized).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Wait for a pooled connection to become available.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_acquire_timeout() -> Duration {
    DEFAULT_ACQUIRE_TIMEOUT
}
fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}
fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Validates the configuration. Runs before any network action.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::configuration("host is required"));
        }
        if self.port == 0 {
            return Err(SmtpError::configuration("port must be non-zero"));
        }
        if self.username.is_empty() {
            return Err(SmtpError::configuration("username is required"));
        }
        if self
            .password
            .as_ref()
            .map(|p| p.expose_secret().is_empty())
            .unwrap_or(true)
        {
            return Err(SmtpError::configuration("password is required"));
        }
        if self.pool_size == 0 {
            return Err(SmtpError::configuration("pool_size must be positive"));
        }
        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true when the configured port implies implicit TLS.
    pub fn implicit_tls(&self) -> bool {
        self.port == IMPLICIT_TLS_PORT
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for [`SmtpConfig`].
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    pool_size: usize,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    command_timeout: Duration,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the authentication credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the pool size.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the pool acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host.unwrap_or_default(),
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            username: self.username.unwrap_or_default(),
            password: self.password,
            pool_size: if self.pool_size == 0 {
                DEFAULT_POOL_SIZE
            } else {
                self.pool_size
            },
            acquire_timeout: if self.acquire_timeout == Duration::ZERO {
                DEFAULT_ACQUIRE_TIMEOUT
            } else {
                self.acquire_timeout
            },
            connect_timeout: if self.connect_timeout == Duration::ZERO {
                DEFAULT_CONNECT_TIMEOUT
            } else {
                self.connect_timeout
            },
            command_timeout: if self.command_timeout == Duration::ZERO {
                DEFAULT_COMMAND_TIMEOUT
            } else {
                self.command_timeout
            },
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
