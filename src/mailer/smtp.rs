//! SMTP transport — the `Mailer` seam and its lettre implementation.
//!
//! The provider acquires one transport per tick; every message in that
//! tick's batches reuses it, amortizing the TLS handshake. Acquisition
//! failure aborts the tick before any send is attempted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::debug;

use super::message::OutgoingEmail;
use crate::config::SmtpConfig;
use crate::error::TransportError;

/// Outbound transport: send one message, success or a structured failure.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingEmail) -> Result<(), TransportError>;
}

/// Acquires a connected `Mailer` once per tick.
#[async_trait]
pub trait MailerProvider: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn Mailer>, TransportError>;
}

/// lettre-backed SMTP mailer with TLS and authenticated login.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: String,
    send_timeout: Duration,
}

impl SmtpMailer {
    /// Build and verify a transport from config.
    ///
    /// `test_connection` performs the TLS handshake and login up front so
    /// connection-level failures surface here, not mid-batch.
    pub async fn connect(config: &SmtpConfig) -> Result<Self, TransportError> {
        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let builder = if config.starttls {
            SmtpTransport::starttls_relay(&config.host)
        } else {
            SmtpTransport::relay(&config.host)
        }
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let transport = builder
            .port(config.port)
            .credentials(credentials)
            .timeout(Some(config.send_timeout))
            .build();

        let probe = transport.clone();
        let ok = tokio::task::spawn_blocking(move || probe.test_connection())
            .await
            .map_err(|e| TransportError::Connect(format!("connection probe panicked: {e}")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !ok {
            return Err(TransportError::Connect(format!(
                "SMTP server {} did not accept the connection",
                config.host
            )));
        }

        debug!(host = %config.host, port = config.port, "SMTP transport ready");
        Ok(Self {
            transport,
            from: config.from_address.clone(),
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingEmail) -> Result<(), TransportError> {
        let message = mail.build(&self.from)?;
        let transport = self.transport.clone();
        let to = mail.to.clone();

        // The blocking send runs off the runtime; the outer timeout bounds
        // it so one slow recipient cannot stall the whole tick.
        let send = tokio::task::spawn_blocking(move || transport.send(&message));
        match tokio::time::timeout(self.send_timeout, send).await {
            Err(_) => Err(TransportError::Timeout {
                to,
                timeout: self.send_timeout,
            }),
            Ok(Err(e)) => Err(TransportError::Send {
                to,
                reason: format!("send task panicked: {e}"),
            }),
            Ok(Ok(Err(e))) => Err(TransportError::Send {
                to,
                reason: e.to_string(),
            }),
            Ok(Ok(Ok(_response))) => Ok(()),
        }
    }
}

/// Default provider: one fresh, verified transport per acquisition.
pub struct SmtpProvider {
    config: SmtpConfig,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailerProvider for SmtpProvider {
    async fn acquire(&self) -> Result<Arc<dyn Mailer>, TransportError> {
        Ok(Arc::new(SmtpMailer::connect(&self.config).await?))
    }
}
