//! IMAP-over-TLS mailbox.
//!
//! Speaks just enough raw IMAP4rev1 for the producer: LOGIN, SELECT,
//! UID SEARCH UNSEEN [SUBJECT ...], UID FETCH BODY.PEEK[] and
//! UID STORE +FLAGS (\Seen). All socket work is blocking and runs inside
//! `spawn_blocking`.
//!
//! The server's SUBJECT search is a substring match, so it narrows the
//! candidates and `SubjectFilter` makes the final whole-word decision.

use std::collections::HashMap;
use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::{Mailbox, SubjectFilter};
use crate::tickets::RawMessage;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox backed by an IMAP account.
///
/// Remembers the UID of every message it lists so `mark_read` can address it
/// by the stable message id the producer uses.
pub struct ImapMailbox {
    config: MailboxConfig,
    uids: Arc<Mutex<HashMap<String, u32>>>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            uids: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn list_unread_matching(
        &self,
        filter: &SubjectFilter,
    ) -> Result<Vec<RawMessage>, MailboxError> {
        let cfg = self.config.clone();
        let filter = filter.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen(&cfg, &filter))
            .await
            .map_err(|e| MailboxError::Task(format!("IMAP fetch task failed: {e}")))??;

        let mut uids = self
            .uids
            .lock()
            .map_err(|e| MailboxError::Task(format!("uid map poisoned: {e}")))?;
        let mut matching = Vec::with_capacity(fetched.len());
        for (uid, msg) in fetched {
            uids.insert(msg.id.clone(), uid);
            matching.push(msg);
        }
        Ok(matching)
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), MailboxError> {
        let uid = self
            .uids
            .lock()
            .map_err(|e| MailboxError::Task(format!("uid map poisoned: {e}")))?
            .get(message_id)
            .copied()
            .ok_or_else(|| MailboxError::UnknownMessage(message_id.to_string()))?;

        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || store_seen(&cfg, uid))
            .await
            .map_err(|e| MailboxError::Task(format!("IMAP store task failed: {e}")))??;

        if let Ok(mut uids) = self.uids.lock() {
            uids.remove(message_id);
        }
        Ok(())
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Server response to one tagged command.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

impl Response {
    fn is_ok(&self, tag: &str) -> bool {
        self.lines
            .last()
            .is_some_and(|l| l.starts_with(tag) && l[tag.len()..].trim_start().starts_with("OK"))
    }
}

struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    /// Connect, read the greeting, log in and select the configured folder.
    fn open(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        tcp.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())
            .map_err(|e| connect_err(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }

        let (tag, login) = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !login.is_ok(&tag) {
            return Err(MailboxError::AuthFailed {
                user: config.username.clone(),
            });
        }

        let (tag, select) = session.command(&format!("SELECT {}", quote(&config.mailbox)))?;
        if !select.is_ok(&tag) {
            return Err(MailboxError::Protocol(format!(
                "SELECT {} failed",
                config.mailbox
            )));
        }

        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a tagged command and collect the response, reading any
    /// `{N}` literals byte-exact.
    fn command(&mut self, cmd: &str) -> Result<(String, Response), MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        IoWrite::write_all(&mut self.tls, format!("{tag} {cmd}\r\n").as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            let done = line.starts_with(&format!("{tag} "));
            response.lines.push(line);
            if done {
                break;
            }
        }
        Ok((tag, response))
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!("IMAP logout failed: {e}");
        }
    }
}

/// Size of a trailing `{N}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let open = trimmed.rfind('{')?;
    let inner = trimmed[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

/// Quote a string for an IMAP command argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// UIDs from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2))
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// `UID SEARCH` for unseen mail whose subject contains any term.
///
/// IMAP `OR` takes two keys, so n terms become n-1 prefixed `OR`s.
fn search_command(terms: &[String]) -> String {
    if terms.is_empty() {
        return "UID SEARCH UNSEEN".to_string();
    }
    let charset = if terms.iter().all(|t| t.is_ascii()) {
        ""
    } else {
        "CHARSET UTF-8 "
    };
    let keys: Vec<String> = terms
        .iter()
        .map(|t| format!("SUBJECT {}", quote(t)))
        .collect();
    format!(
        "UID SEARCH {charset}UNSEEN {}{}",
        "OR ".repeat(terms.len() - 1),
        keys.join(" ")
    )
}

/// Fetch up to `max_per_poll` unseen messages that pass `filter`, oldest
/// first, without touching their `\Seen` flag.
fn fetch_unseen(
    config: &MailboxConfig,
    filter: &SubjectFilter,
) -> Result<Vec<(u32, RawMessage)>, MailboxError> {
    let mut session = ImapSession::open(config)?;

    let (tag, search) = session.command(&search_command(filter.terms()))?;
    if !search.is_ok(&tag) {
        return Err(MailboxError::Protocol("UID SEARCH failed".into()));
    }
    let mut uids = parse_search(&search.lines);
    uids.sort_unstable();
    debug!(count = uids.len(), "Unseen candidates on server");

    let limit = config.max_per_poll.max(1);
    let mut results = Vec::with_capacity(uids.len().min(limit));
    for uid in uids {
        if results.len() >= limit {
            debug!(limit, "Per-poll limit reached; the rest wait for next cycle");
            break;
        }
        let (tag, fetch) = session.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
        if !fetch.is_ok(&tag) {
            warn!(uid, "UID FETCH failed, skipping message");
            continue;
        }
        let Some(raw) = fetch.literals.first() else {
            warn!(uid, "UID FETCH returned no body");
            continue;
        };
        match parse_raw_message(raw) {
            Some(msg) if filter.matches(&msg.subject) => results.push((uid, msg)),
            Some(msg) => debug!(uid, subject = %msg.subject, "Subject did not match filter"),
            None => warn!(uid, "Could not parse message, skipping"),
        }
    }

    session.logout();
    Ok(results)
}

/// Flag one message `\Seen`.
fn store_seen(config: &MailboxConfig, uid: u32) -> Result<(), MailboxError> {
    let mut session = ImapSession::open(config)?;
    let (tag, store) = session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
    session.logout();
    if store.is_ok(&tag) {
        Ok(())
    } else {
        Err(MailboxError::Protocol(format!("UID STORE {uid} failed")))
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Turn an RFC 5322 message into a `RawMessage`.
///
/// Messages without a `Message-ID` get a `gen-<uuid>` id derived from their
/// bytes, so re-listing the same message yields the same id. Messages without
/// a usable date are stamped with the current time.
pub fn parse_raw_message(raw: &[u8]) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, raw)));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(RawMessage {
        id,
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &[u8] = b"From: Alice Example <alice@example.com>\r\n\
To: support@example.com\r\n\
Subject: Help with my order\r\n\
Message-ID: <order-123@example.com>\r\n\
Date: Mon, 2 Feb 2026 10:30:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
My order #123 never arrived. Call me at 555-0100.\r\n";

    const HTML_ONLY: &[u8] = b"From: bob@example.com\r\n\
Subject: Support request\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>The <b>app</b> crashes</p></body></html>\r\n";

    #[test]
    fn parses_plain_message() {
        let msg = parse_raw_message(PLAIN).unwrap();
        assert_eq!(msg.id, "order-123@example.com");
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.subject, "Help with my order");
        assert!(msg.body.contains("never arrived"));
        assert_eq!(msg.received_at.to_rfc3339(), "2026-02-02T10:30:00+00:00");
    }

    #[test]
    fn html_body_is_stripped_and_missing_id_generated() {
        let msg = parse_raw_message(HTML_ONLY).unwrap();
        assert!(msg.id.starts_with("gen-"));
        assert_eq!(parse_raw_message(HTML_ONLY).unwrap().id, msg.id);
        assert!(msg.body.contains("crashes"));
        assert!(!msg.body.contains('<'));
    }

    #[test]
    fn literal_marker_parsing() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 7 FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_len("A3 OK done\r\n"), None);
    }

    #[test]
    fn search_response_parsing() {
        let lines = vec![
            "* SEARCH 4 9 12\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec![4, 9, 12]);
        assert!(parse_search(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn tagged_ok_detection() {
        let resp = Response {
            lines: vec!["* 2 EXISTS\r\n".into(), "A2 OK [READ-WRITE] done\r\n".into()],
            literals: Vec::new(),
        };
        assert!(resp.is_ok("A2"));
        let bad = Response {
            lines: vec!["A1 NO [AUTHENTICATIONFAILED] nope\r\n".into()],
            literals: Vec::new(),
        };
        assert!(!bad.is_ok("A1"));
    }

    #[test]
    fn search_narrows_by_subject_terms() {
        fn terms(ts: &[&str]) -> Vec<String> {
            ts.iter().map(|t| t.to_string()).collect()
        }
        assert_eq!(search_command(&[]), "UID SEARCH UNSEEN");
        assert_eq!(
            search_command(&terms(&["Help"])),
            "UID SEARCH UNSEEN SUBJECT \"Help\""
        );
        assert_eq!(
            search_command(&terms(&["Support", "Query", "Help"])),
            "UID SEARCH UNSEEN OR OR SUBJECT \"Support\" SUBJECT \"Query\" SUBJECT \"Help\""
        );
        assert!(
            search_command(&terms(&["Hilfe", "Anfrage", "Störung"]))
                .starts_with("UID SEARCH CHARSET UTF-8 UNSEEN OR OR ")
        );
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote("pa\"ss\\word"), "\"pa\\\"ss\\\\word\"");
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<div><b>Bold</b> and <i>italic</i></div>"), "Bold and italic");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }
}
