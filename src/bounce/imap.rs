//! Minimal IMAP-over-TLS client — just enough protocol for the bounce
//! scanner: LOGIN, SELECT, SEARCH, FETCH, STORE, LOGOUT.
//!
//! Blocking I/O with a socket read timeout; run it under `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use secrecy::ExposeSecret;

use crate::config::ImapConfig;
use crate::error::ScanError;

/// An authenticated IMAP session over TLS.
pub struct ImapSession {
    tls: StreamOwned<ClientConnection, TcpStream>,
    tag: u32,
}

impl ImapSession {
    /// Connect, complete the TLS handshake, and consume the server
    /// greeting. Does not log in.
    pub fn connect(config: &ImapConfig) -> Result<Self, ScanError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| ScanError::Connect(e.to_string()))?;
        tcp.set_read_timeout(Some(config.read_timeout))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name: ServerName<'_> = ServerName::try_from(config.host.clone())
            .map_err(|e| ScanError::Tls(e.to_string()))?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| ScanError::Tls(e.to_string()))?;
        let tls = StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag: 0 };
        let _greeting = session.read_line()?;
        Ok(session)
    }

    /// Connect and log in with the configured credentials.
    pub fn open(config: &ImapConfig) -> Result<Self, ScanError> {
        let mut session = Self::connect(config)?;
        session.login(&config.username, config.password.expose_secret())?;
        session.select(&config.mailbox)?;
        Ok(session)
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), ScanError> {
        let lines = self.command(&format!("LOGIN \"{user}\" \"{password}\""))?;
        if tagged_ok(&lines) {
            Ok(())
        } else {
            Err(ScanError::Auth {
                user: user.to_string(),
            })
        }
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), ScanError> {
        let lines = self.command(&format!("SELECT \"{mailbox}\""))?;
        if tagged_ok(&lines) {
            Ok(())
        } else {
            Err(ScanError::Protocol(format!("SELECT {mailbox} refused")))
        }
    }

    /// Run a SEARCH and return matching sequence numbers.
    pub fn search(&mut self, criteria: &str) -> Result<Vec<u32>, ScanError> {
        let lines = self.command(&format!("SEARCH {criteria}"))?;
        if !tagged_ok(&lines) {
            return Err(ScanError::Protocol("SEARCH refused".into()));
        }

        let mut seqs = Vec::new();
        for line in &lines {
            if line.starts_with("* SEARCH") {
                seqs.extend(
                    line.split_whitespace()
                        .skip(2)
                        .filter_map(|n| n.parse::<u32>().ok()),
                );
            }
        }
        Ok(seqs)
    }

    /// Fetch one message as raw RFC 822 bytes.
    ///
    /// Line-oriented: the untagged FETCH line and the tagged completion are
    /// stripped; the literal in between is the message. A trailing `)` from
    /// the FETCH response may remain — the mail parser tolerates it.
    pub fn fetch_rfc822(&mut self, seq: u32) -> Result<Vec<u8>, ScanError> {
        let lines = self.command(&format!("FETCH {seq} RFC822"))?;
        if !tagged_ok(&lines) {
            return Err(ScanError::Protocol(format!("FETCH {seq} refused")));
        }
        let raw: String = lines
            .iter()
            .skip(1)
            .take(lines.len().saturating_sub(2))
            .cloned()
            .collect();
        Ok(raw.into_bytes())
    }

    /// Flag a message `\Seen` so the next scan skips it.
    pub fn store_seen(&mut self, seq: u32) -> Result<(), ScanError> {
        let lines = self.command(&format!("STORE {seq} +FLAGS (\\Seen)"))?;
        if tagged_ok(&lines) {
            Ok(())
        } else {
            Err(ScanError::Protocol(format!("STORE {seq} refused")))
        }
    }

    /// Best-effort LOGOUT; the session is gone either way.
    pub fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }

    // ── Protocol plumbing ───────────────────────────────────────────

    /// Send one tagged command and collect response lines up to and
    /// including the tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, ScanError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        self.tls.write_all(full.as_bytes())?;
        self.tls.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ScanError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(ScanError::Protocol("connection closed".into())),
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
}

/// The tagged completion line reports success.
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_ok_detection() {
        assert!(tagged_ok(&["* SEARCH 1 2".into(), "A3 OK SEARCH done".into()]));
        assert!(!tagged_ok(&["A3 NO invalid".into()]));
        assert!(!tagged_ok(&["A3 BAD parse".into()]));
        assert!(!tagged_ok(&[]));
    }
}
