//! Configuration — an immutable snapshot built once from the environment.
//!
//! Components receive the snapshot behind an `Arc`; nothing mutates it at
//! runtime. Restart (or rebuild the snapshot between runs) to change
//! settings.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// From address for campaign and report mail.
    pub from_address: String,
    /// STARTTLS on the submission port when true, implicit TLS otherwise.
    pub starttls: bool,
    /// Bound on each individual send.
    pub send_timeout: Duration,
}

/// Inbound IMAP settings for the bounce mailbox.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Sender pattern that marks a message as a bounce notification.
    pub daemon_from: String,
    /// Subject pattern that marks a message as a bounce notification.
    pub daemon_subject: String,
    /// Socket read timeout for IMAP commands.
    pub read_timeout: Duration,
}

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum recipient tasks processed per campaign per tick.
    pub batch_size: usize,
    /// Delivery tick interval.
    pub delivery_interval: Duration,
    /// Bounce scan interval.
    pub scan_interval: Duration,
    /// Operator address for completion reports. None disables reports.
    pub operator_email: Option<String>,
}

/// Root configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub smtp: SmtpConfig,
    /// None disables the bounce scanner.
    pub imap: Option<ImapConfig>,
    pub engine: EngineConfig,
    pub db_path: String,
}

impl Config {
    /// Build the snapshot from `CAMPAIGNER_*` environment variables.
    ///
    /// SMTP settings are required; IMAP settings are optional (the bounce
    /// scanner is disabled when `CAMPAIGNER_IMAP_HOST` is unset).
    pub fn from_env() -> Result<Self, ConfigError> {
        let smtp = SmtpConfig {
            host: require("CAMPAIGNER_SMTP_HOST")?,
            port: parse_or("CAMPAIGNER_SMTP_PORT", 587)?,
            username: require("CAMPAIGNER_SMTP_USERNAME")?,
            password: SecretString::from(require("CAMPAIGNER_SMTP_PASSWORD")?),
            from_address: require("CAMPAIGNER_FROM_ADDRESS")?,
            starttls: parse_or("CAMPAIGNER_SMTP_STARTTLS", true)?,
            send_timeout: Duration::from_secs(parse_or("CAMPAIGNER_SEND_TIMEOUT_SECS", 30u64)?),
        };

        let imap = match std::env::var("CAMPAIGNER_IMAP_HOST") {
            Ok(host) => Some(ImapConfig {
                host,
                port: parse_or("CAMPAIGNER_IMAP_PORT", 993)?,
                username: optional("CAMPAIGNER_IMAP_USERNAME")
                    .unwrap_or_else(|| smtp.username.clone()),
                password: optional("CAMPAIGNER_IMAP_PASSWORD")
                    .map(SecretString::from)
                    .unwrap_or_else(|| smtp.password.clone()),
                mailbox: optional("CAMPAIGNER_IMAP_MAILBOX").unwrap_or_else(|| "INBOX".into()),
                daemon_from: optional("CAMPAIGNER_BOUNCE_FROM")
                    .unwrap_or_else(|| "MAILER-DAEMON".into()),
                daemon_subject: optional("CAMPAIGNER_BOUNCE_SUBJECT")
                    .unwrap_or_else(|| "Mail Delivery Subsystem".into()),
                read_timeout: Duration::from_secs(parse_or(
                    "CAMPAIGNER_IMAP_TIMEOUT_SECS",
                    30u64,
                )?),
            }),
            Err(_) => None,
        };

        let engine = EngineConfig {
            batch_size: parse_or("CAMPAIGNER_BATCH_SIZE", 100usize)?,
            delivery_interval: Duration::from_secs(parse_or(
                "CAMPAIGNER_DELIVERY_INTERVAL_SECS",
                60u64,
            )?),
            scan_interval: Duration::from_secs(parse_or("CAMPAIGNER_SCAN_INTERVAL_SECS", 300u64)?),
            operator_email: optional("CAMPAIGNER_OPERATOR_EMAIL"),
        };

        Ok(Self {
            smtp,
            imap,
            engine,
            db_path: optional("CAMPAIGNER_DB_PATH")
                .unwrap_or_else(|| "./data/campaigner.db".into()),
        })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_smtp_host_is_an_error() {
        // SAFETY: tests here touch distinct env vars; no concurrent reader.
        unsafe { std::env::remove_var("CAMPAIGNER_SMTP_HOST") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn parse_or_rejects_garbage() {
        unsafe { std::env::set_var("CAMPAIGNER_TEST_PORT", "not-a-number") };
        let err = parse_or::<u16>("CAMPAIGNER_TEST_PORT", 25).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var("CAMPAIGNER_TEST_PORT") };
    }

    #[test]
    fn parse_or_defaults_when_unset() {
        unsafe { std::env::remove_var("CAMPAIGNER_TEST_UNSET") };
        assert_eq!(parse_or("CAMPAIGNER_TEST_UNSET", 42u64).unwrap(), 42);
    }
}
