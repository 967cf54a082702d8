//! Wire message construction.
//!
//! [`MessageBuilder`] turns a validated [`Email`] into RFC 5322 bytes:
//! headers, then either a single body part, a multipart/alternative pair
//! (text + HTML), or a multipart/mixed envelope wrapping the body and
//! base64 attachments. Every line ends with CRLF. Building is infallible
//! because header validation already happened when the email was built.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use uuid::Uuid;

use crate::email::{Email, Priority};

/// Text and HTML parts are emitted as raw UTF-8.
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";

/// Builds RFC 5322 messages for a sending domain.
///
/// The domain only feeds the Message-ID; everything else comes from the
/// email itself.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    domain: String,
}

impl MessageBuilder {
    /// Creates a builder that stamps Message-IDs with the given domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// Builds the full message for an email.
    pub fn build(&self, email: &Email) -> Vec<u8> {
        let now = Utc::now();
        let mut out = Vec::new();

        write_header(&mut out, "From", &email.from);
        write_header(&mut out, "To", &email.to.join(", "));
        if !email.cc.is_empty() {
            write_header(&mut out, "Cc", &email.cc.join(", "));
        }
        // BCC recipients go on the envelope only, never into headers.
        write_header(&mut out, "Subject", &encode_header_value(&email.subject));
        write_header(
            &mut out,
            "Date",
            &now.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
        );
        write_header(
            &mut out,
            "Message-ID",
            &format!("<{}.{}@{}>", Uuid::new_v4(), now.timestamp(), self.domain),
        );

        match email.priority {
            Priority::High => {
                write_header(&mut out, "X-Priority", "1");
                write_header(&mut out, "Importance", "high");
            }
            Priority::Low => {
                write_header(&mut out, "X-Priority", "5");
                write_header(&mut out, "Importance", "low");
            }
            Priority::Normal => {}
        }

        for (name, value) in &email.headers {
            write_header(&mut out, name, &encode_header_value(value));
        }

        write_header(&mut out, "MIME-Version", "1.0");

        // Boundaries derive from the build timestamp so that outer and
        // inner always differ within one message.
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
        let outer = format!("outer_{}", nanos);
        let inner = format!("inner_{}", nanos + 1);

        let text = email.text_body.as_deref().filter(|b| !b.is_empty());
        let html = email.html_body.as_deref().filter(|b| !b.is_empty());

        if email.has_attachments() {
            write_header(
                &mut out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{}\"", outer),
            );
            out.extend_from_slice(b"\r\n");

            // The first mixed part is always the alternative block,
            // whichever bodies are present.
            out.extend_from_slice(format!("--{}\r\n", outer).as_bytes());
            write_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{}\"", inner),
            );
            out.extend_from_slice(b"\r\n");
            write_alternative(&mut out, &inner, text, html);

            for attachment in &email.attachments {
                out.extend_from_slice(format!("--{}\r\n", outer).as_bytes());
                write_header(
                    &mut out,
                    "Content-Type",
                    &format!("{}; name=\"{}\"", attachment.content_type, attachment.filename),
                );
                write_header(&mut out, "Content-Transfer-Encoding", "base64");
                write_header(
                    &mut out,
                    "Content-Disposition",
                    &format!("attachment; filename=\"{}\"", attachment.filename),
                );
                out.extend_from_slice(b"\r\n");

                let encoded = BASE64.encode(&attachment.data);
                for chunk in encoded.as_bytes().chunks(76) {
                    out.extend_from_slice(chunk);
                    out.extend_from_slice(b"\r\n");
                }
            }

            out.extend_from_slice(format!("--{}--\r\n", outer).as_bytes());
        } else {
            write_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{}\"", outer),
            );
            out.extend_from_slice(b"\r\n");
            write_alternative(&mut out, &outer, text, html);
        }

        out
    }

    /// Prepares message bytes for the DATA phase: dots at line starts are
    /// doubled and the payload is terminated with `<CRLF>.<CRLF>`.
    pub fn prepare_data(message: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(message.len() + 64);
        let mut at_line_start = true;

        for &byte in message {
            if at_line_start && byte == b'.' {
                out.push(b'.');
            }
            out.push(byte);
            at_line_start = byte == b'\n';
        }

        if !out.ends_with(b"\r\n") {
            if out.ends_with(b"\n") {
                out.pop();
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
        out
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

/// Writes one header line, folding at 78 characters.
fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    let header = format!("{}: {}", name, value);
    out.extend_from_slice(fold_header(&header).as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Folds a long header onto continuation lines starting with a space.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current = String::new();

    for word in header.split(' ') {
        if current.is_empty() {
            current = word.to_string();
        } else if current.len() + 1 + word.len() <= 76 {
            current.push(' ');
            current.push_str(word);
        } else {
            result.push_str(&current);
            result.push_str("\r\n ");
            current = word.to_string();
        }
    }

    result.push_str(&current);
    result
}

/// RFC 2047 B-encodes a header value when it contains non-ASCII.
fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }
    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

/// Writes the multipart/alternative block, emitting only the present
/// sub-parts, text before HTML so clients prefer HTML.
fn write_alternative(out: &mut Vec<u8>, boundary: &str, text: Option<&str>, html: Option<&str>) {
    if let Some(text) = text {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        write_header(out, "Content-Type", TEXT_PLAIN);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if let Some(html) = html {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        write_header(out, "Content-Type", TEXT_HTML);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(html.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
}
