//! SMTP wire protocol.
//!
//! RFC 5321 commands and responses, limited to the subset the delivery
//! pipeline needs: session setup (EHLO, STARTTLS, AUTH), the mail
//! transaction (MAIL FROM, RCPT TO, DATA, RSET) and keepalive (NOOP, QUIT).

use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response.
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address.
        address: String,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation (liveness probe).
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => {
                if let Some(response) = initial_response {
                    format!("AUTH {} {}", mechanism, response)
                } else {
                    format!("AUTH {}", mechanism)
                }
            }
            SmtpCommand::MailFrom { address } => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // AUTH carries credentials; never render the payload.
        if let SmtpCommand::Auth { mechanism, .. } = self {
            return write!(f, "AUTH {} ****", mechanism);
        }
        write!(f, "{}", self.to_smtp_string())
    }
}

/// SMTP response from the server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g. 250, 354, 550).
    pub code: u16,
    /// Response message lines, code stripped.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Parses a response from raw lines, as read off the wire.
    ///
    /// Multiline responses use `XYZ-text` continuations terminated by a
    /// final `XYZ text` line; every line must repeat the same code.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("empty response"));
        }

        let mut messages = Vec::new();
        let mut code = 0u16;

        for (i, line) in lines.iter().enumerate() {
            if line.len() < 3 {
                return Err(SmtpError::protocol(format!("response too short: {}", line)));
            }

            // get() rather than slicing: the reply is attacker-supplied
            // and may put a multibyte character across the boundary.
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|prefix| prefix.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("invalid status code: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol(
                    "inconsistent status codes in multiline response",
                ));
            }

            messages.push(line.get(4..).unwrap_or_default().to_string());
        }

        Ok(Self {
            code,
            message: messages,
        })
    }

    /// Returns true for a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true for a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns true if the EHLO reply advertises the given capability.
    pub fn advertises(&self, capability: &str) -> bool {
        let upper = capability.to_uppercase();
        self.message
            .iter()
            .any(|line| line.trim().to_uppercase().starts_with(&upper))
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join(" ")
    }

    /// Converts a non-success reply to an error.
    pub fn to_error(&self) -> SmtpError {
        SmtpError::from_smtp_response(self.code, self.full_message())
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.code,
            self.message.first().map(String::as_str).unwrap_or("")
        )
    }
}

/// Response codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable.
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_formatting() {
        assert_eq!(
            SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(),
            "EHLO localhost"
        );
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "sender@example.com".to_string(),
            }
            .to_smtp_string(),
            "MAIL FROM:<sender@example.com>"
        );
        assert_eq!(
            SmtpCommand::RcptTo {
                address: "rcpt@example.com".to_string(),
            }
            .to_smtp_string(),
            "RCPT TO:<rcpt@example.com>"
        );
    }

    #[test]
    fn auth_payload_is_redacted_in_display() {
        let cmd = SmtpCommand::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("AHNlbmRlcgBodW50ZXIy".to_string()),
        };
        let rendered = cmd.to_string();
        assert!(!rendered.contains("AHNlbmRlcgBodW50ZXIy"));
        assert!(rendered.contains("PLAIN"));
    }

    #[test]
    fn parse_single_line() {
        let response = SmtpResponse::parse(&["250 OK".to_string()]).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.full_message(), "OK");
    }

    #[test]
    fn parse_multiline() {
        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 3);
        assert!(response.advertises("STARTTLS"));
        assert!(!response.advertises("CHUNKING"));
    }

    #[test]
    fn parse_rejects_mixed_codes() {
        let lines = vec!["250-hello".to_string(), "550 no".to_string()];
        assert!(SmtpResponse::parse(&lines).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["xx".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["abc hello".to_string()]).is_err());
    }

    #[test]
    fn parse_survives_multibyte_replies() {
        // Multibyte character across the code boundary
        assert!(SmtpResponse::parse(&["éé0 hello".to_string()]).is_err());

        // Valid code, multibyte where the separator should be
        let response = SmtpResponse::parse(&["250é oops".to_string()]).unwrap();
        assert_eq!(response.code, 250);
    }

    #[test]
    fn failure_reply_converts_to_error() {
        let response = SmtpResponse::parse(&["550 user unknown".to_string()]).unwrap();
        let err = response.to_error();
        assert_eq!(err.smtp_code(), Some(550));
    }
}
