//! Outgoing message construction — correlation tagging and lettre assembly.

use lettre::Message;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};

use crate::error::TransportError;

/// Prefix the human subject with the correlation token.
///
/// The `[CID:<id>]` marker must survive relays verbatim so bounces can be
/// attributed back to the campaign. Best-effort: a relay that rewrites
/// subjects breaks correlation for its bounces.
pub fn tag_subject(campaign_id: i64, subject: &str) -> String {
    format!("[CID:{campaign_id}] {subject}")
}

/// Custom header carrying the raw campaign id, redundant with the subject
/// token.
#[derive(Debug, Clone)]
pub struct XCampaignId(pub String);

impl Header for XCampaignId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Campaign-ID")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// A file attached to an outgoing message.
#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

/// One outgoing email, transport-agnostic.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    /// HTML body; a plain-text alternative is derived automatically.
    pub html_body: Option<String>,
    /// Plain-text body, used alone when no HTML body is set.
    pub text_body: Option<String>,
    /// Campaign id for the `X-Campaign-ID` header.
    pub campaign_id: Option<i64>,
    pub attachment: Option<EmailAttachment>,
}

impl OutgoingEmail {
    /// Assemble a lettre message from this email.
    pub fn build(&self, from: &str) -> Result<Message, TransportError> {
        let from_mailbox: Mailbox =
            from.parse().map_err(|e| TransportError::InvalidAddress {
                address: from.to_string(),
                reason: format!("{e}"),
            })?;
        let to_mailbox: Mailbox =
            self.to.parse().map_err(|e| TransportError::InvalidAddress {
                address: self.to.clone(),
                reason: format!("{e}"),
            })?;

        let mut builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(self.subject.clone());

        if let Some(id) = self.campaign_id {
            builder = builder.header(XCampaignId(id.to_string()));
        }

        let build_err = |e: lettre::error::Error| TransportError::Build(e.to_string());

        match (&self.html_body, &self.attachment) {
            (_, Some(attachment)) => {
                let content_type = ContentType::parse(&attachment.content_type)
                    .map_err(|e| TransportError::Build(format!("attachment content type: {e}")))?;
                let body = self.text_body.clone().unwrap_or_default();
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(SinglePart::plain(body))
                            .singlepart(
                                Attachment::new(attachment.filename.clone())
                                    .body(attachment.content.clone(), content_type),
                            ),
                    )
                    .map_err(build_err)
            }
            (Some(html), None) => {
                let plain = self
                    .text_body
                    .clone()
                    .unwrap_or_else(|| strip_html(html));
                builder
                    .multipart(MultiPart::alternative_plain_html(plain, html.clone()))
                    .map_err(build_err)
            }
            (None, None) => builder
                .body(self.text_body.clone().unwrap_or_default())
                .map_err(build_err),
        }
    }
}

/// Strip HTML tags from content (basic plain-text fallback).
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
