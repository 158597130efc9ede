//! Outbound submission through the sending side.

pub mod smtp;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::message::ForwardEnvelope;

pub use smtp::SmtpSender;

/// Accepts a fully rewritten raw message for delivery.
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Submit `envelope.raw` from `envelope.from` to every `envelope.to`.
    ///
    /// Permanent refusals come back as [`DispatchError::Rejected`] or
    /// [`DispatchError::InvalidAddress`] and must not be retried.
    async fn send_raw(&self, envelope: &ForwardEnvelope) -> Result<(), DispatchError>;
}
