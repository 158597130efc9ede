//! SMTP relay sender built on lettre.

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use super::MailSender;
use crate::config::SmtpConfig;
use crate::error::{ConfigError, DispatchError};
use crate::message::ForwardEnvelope;

/// Relays raw messages through an authenticated STARTTLS submission endpoint.
#[derive(Clone)]
pub struct SmtpSender {
    transport: SmtpTransport,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SES_PROXY_SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

/// Build the SMTP envelope, rejecting unparsable addresses up front.
pub fn smtp_envelope(envelope: &ForwardEnvelope) -> Result<Envelope, DispatchError> {
    let parse = |raw: &str| {
        raw.parse::<Address>()
            .map_err(|e| DispatchError::InvalidAddress {
                address: raw.to_string(),
                reason: e.to_string(),
            })
    };

    let from = parse(&envelope.from)?;
    let to = envelope
        .to
        .iter()
        .map(|addr| parse(addr))
        .collect::<Result<Vec<_>, _>>()?;

    Envelope::new(Some(from), to).map_err(|e| DispatchError::InvalidAddress {
        address: envelope.to.join(", "),
        reason: e.to_string(),
    })
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send_raw(&self, envelope: &ForwardEnvelope) -> Result<(), DispatchError> {
        let smtp_envelope = smtp_envelope(envelope)?;
        let transport = self.transport.clone();
        let raw = envelope.raw.clone();

        let result = tokio::task::spawn_blocking(move || transport.send_raw(&smtp_envelope, &raw))
            .await
            .map_err(|e| DispatchError::Transient {
                reason: format!("SMTP task failed: {e}"),
            })?;

        match result {
            Ok(_) => {
                info!(recipients = envelope.to.len(), "Message relayed");
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(DispatchError::Rejected {
                reason: e.to_string(),
            }),
            Err(e) => Err(DispatchError::Transient {
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: &str, to: &[&str]) -> ForwardEnvelope {
        ForwardEnvelope {
            from: from.into(),
            to: to.iter().map(|s| s.to_string()).collect(),
            raw: b"Subject: x\r\n\r\nbody".to_vec(),
        }
    }

    #[test]
    fn envelope_carries_all_recipients() {
        let env = smtp_envelope(&envelope(
            "forwarder@proxy.example",
            &["a@realmail.example", "b@realmail.example"],
        ))
        .unwrap();
        assert_eq!(env.to().len(), 2);
        assert_eq!(
            env.from().map(|a| a.to_string()).as_deref(),
            Some("forwarder@proxy.example")
        );
    }

    #[test]
    fn bad_recipient_is_invalid_address() {
        let err = smtp_envelope(&envelope("forwarder@proxy.example", &["not an address"]))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidAddress { .. }));
    }

    #[test]
    fn builds_without_credentials() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            username: None,
            password: None,
        };
        assert!(SmtpSender::new(&config).is_ok());
    }
}
