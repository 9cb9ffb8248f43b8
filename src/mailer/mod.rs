//! Outbound mail — message construction and the SMTP transport seam.

pub mod message;
pub mod smtp;

pub use message::{EmailAttachment, OutgoingEmail, tag_subject};
pub use smtp::{Mailer, MailerProvider, SmtpProvider};
