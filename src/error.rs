//! Error types for Campaigner.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mailbox scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Campaign {0} is being processed by another trigger")]
    CampaignBusy(i64),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Outbound transport errors.
///
/// `Connect` is connection-level and aborts the whole tick; the remaining
/// variants are per-recipient and recorded on the task.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SMTP connection failed: {0}")]
    Connect(String),

    #[error("Send to {to} failed: {reason}")]
    Send { to: String, reason: String },

    #[error("Send to {to} timed out after {timeout:?}")]
    Timeout { to: String, timeout: Duration },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),
}

impl TransportError {
    /// Connection-level failures abort the tick; everything else is
    /// isolated to a single recipient.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// Inbound mailbox scan errors.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("IMAP connection failed: {0}")]
    Connect(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("IMAP login failed for {user}")]
    Auth { user: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Report generation/delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("No operator report address configured")]
    NoOperatorAddress,

    #[error("Report delivery failed: {0}")]
    Delivery(#[from] TransportError),

    #[error("Report data error: {0}")]
    Data(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
