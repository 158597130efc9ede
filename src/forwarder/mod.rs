//! The per-message forwarding pipeline.
//!
//! resolve aliases → load the archived body once → rewrite headers →
//! dispatch once. Every external call runs under the shared retry policy.

pub mod rewrite;

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::alias::AliasResolver;
use crate::archive::{ArchiveStore, object_key};
use crate::config::ForwarderSettings;
use crate::dispatch::MailSender;
use crate::error::{AliasError, ForwardError};
use crate::message::{ForwardEnvelope, InboundMessage};
use crate::retry::with_retry;

use rewrite::Rewrite;

// ── Report types ────────────────────────────────────────────────────

/// Where a message is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Received,
    Archived,
    AliasResolving,
    BodyLoaded,
    BodyMissing,
    HeadersRewritten,
    Dispatched,
    DispatchFailed,
    /// Too large or malformed.
    Rejected,
    /// No recipient resolved to a destination.
    Unroutable,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Dispatched
                | Self::DispatchFailed
                | Self::BodyMissing
                | Self::Rejected
                | Self::Unroutable
        )
    }
}

/// Outcome of resolving one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Resolved { destination: String },
    Defaulted { destination: String },
    Skipped { reason: String },
}

impl Resolution {
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Resolved { destination } | Self::Defaulted { destination } => Some(destination),
            Self::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientReport {
    pub recipient: String,
    pub resolution: Resolution,
    pub status: DeliveryStatus,
}

/// Observable record of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardReport {
    pub message_id: String,
    pub state: MessageState,
    /// Every state the message passed through, in order.
    pub history: Vec<MessageState>,
    pub recipients: Vec<RecipientReport>,
    pub error: Option<String>,
}

impl ForwardReport {
    fn new(message: &InboundMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            state: MessageState::Received,
            history: vec![MessageState::Received],
            recipients: Vec::new(),
            error: None,
        }
    }

    /// True only when the message was dispatched.
    pub fn is_success(&self) -> bool {
        self.state == MessageState::Dispatched
    }

    pub fn failed_recipients(&self) -> usize {
        self.recipients
            .iter()
            .filter(|r| matches!(r.status, DeliveryStatus::Failed { .. }))
            .count()
    }

    fn advance(&mut self, state: MessageState) {
        self.state = state;
        self.history.push(state);
    }

    /// Record a message-level failure. Every recipient not already failed
    /// fails with the same reason.
    fn fail(mut self, state: MessageState, err: ForwardError) -> Self {
        let reason = err.to_string();
        for recipient in &mut self.recipients {
            if !matches!(recipient.status, DeliveryStatus::Failed { .. }) {
                recipient.status = DeliveryStatus::Failed {
                    reason: reason.clone(),
                };
            }
        }
        error!(
            message_id = %self.message_id,
            state = ?state,
            recipients = self.recipients.len(),
            error = %reason,
            "Forwarding failed"
        );
        self.advance(state);
        self.error = Some(reason);
        self
    }
}

// ── Forwarder ───────────────────────────────────────────────────────

/// Turns an archived inbound message into one rewritten outbound message.
///
/// Holds no per-message state; one instance serves concurrent invocations.
pub struct Forwarder {
    aliases: AliasResolver,
    archive: Arc<dyn ArchiveStore>,
    sender: Arc<dyn MailSender>,
    settings: ForwarderSettings,
}

impl Forwarder {
    pub fn new(
        aliases: AliasResolver,
        archive: Arc<dyn ArchiveStore>,
        sender: Arc<dyn MailSender>,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            aliases,
            archive,
            sender,
            settings,
        }
    }

    /// Run the pipeline for one message. Never panics on bad input; every
    /// outcome is in the report.
    pub async fn forward(&self, message: &InboundMessage) -> ForwardReport {
        let mut report = ForwardReport::new(message);
        // The receiving edge only notifies after the object is stored.
        report.advance(MessageState::Archived);

        if let Err(reason) = validate_event(message) {
            report.recipients = message
                .recipients
                .iter()
                .map(|recipient| RecipientReport {
                    recipient: recipient.clone(),
                    resolution: Resolution::Skipped {
                        reason: reason.clone(),
                    },
                    status: DeliveryStatus::Failed {
                        reason: reason.clone(),
                    },
                })
                .collect();
            return report.fail(MessageState::Rejected, ForwardError::Malformed(reason));
        }

        report.advance(MessageState::AliasResolving);
        report.recipients = join_all(
            message
                .recipients
                .iter()
                .map(|recipient| self.resolve_recipient(&message.message_id, recipient)),
        )
        .await;

        let destinations = unique_destinations(&report.recipients);
        if destinations.is_empty() {
            return report.fail(
                MessageState::Unroutable,
                ForwardError::NoDeliverableRecipients {
                    message_id: message.message_id.clone(),
                },
            );
        }

        let key = object_key(&self.settings.archive_prefix, &message.message_id);
        let archive = &self.archive;
        let read_key = key.as_str();
        let raw = match with_retry(&self.settings.retry, "archive_read", move || {
            archive.get(read_key)
        })
        .await
        {
            Ok(raw) => raw,
            Err(source) => {
                return report.fail(
                    MessageState::BodyMissing,
                    ForwardError::BodyMissing {
                        message_id: message.message_id.clone(),
                        source,
                    },
                );
            }
        };
        report.advance(MessageState::BodyLoaded);

        if raw.len() > self.settings.max_message_bytes {
            return report.fail(
                MessageState::Rejected,
                ForwardError::MessageTooLarge {
                    size: raw.len(),
                    max: self.settings.max_message_bytes,
                },
            );
        }

        let rewritten = Rewrite {
            sending_identity: &self.settings.from_email,
            destinations: &destinations,
            subject_marker: self.settings.subject_prefix.as_deref(),
            envelope_sender: &message.sender,
        }
        .apply(&raw);
        let rewritten = match rewritten {
            Ok(bytes) => bytes,
            Err(e) => return report.fail(MessageState::Rejected, e),
        };
        report.advance(MessageState::HeadersRewritten);

        let envelope = ForwardEnvelope {
            from: self.settings.from_email.clone(),
            to: destinations,
            raw: rewritten,
        };
        let sender = &self.sender;
        let outbound = &envelope;
        if let Err(e) =
            with_retry(&self.settings.retry, "dispatch", move || sender.send_raw(outbound)).await
        {
            return report.fail(MessageState::DispatchFailed, ForwardError::Dispatch(e));
        }

        for recipient in &mut report.recipients {
            if recipient.status == DeliveryStatus::Pending {
                recipient.status = DeliveryStatus::Delivered;
            }
        }
        report.advance(MessageState::Dispatched);
        info!(
            message_id = %report.message_id,
            destinations = envelope.to.len(),
            skipped = report.failed_recipients(),
            bytes = envelope.raw.len(),
            "Message forwarded"
        );
        report
    }

    async fn resolve_recipient(&self, message_id: &str, recipient: &str) -> RecipientReport {
        let mut resolution = match self.aliases.resolve(recipient).await {
            Ok(Some(destination)) => Resolution::Resolved { destination },
            Ok(None) => match &self.settings.default_destination {
                Some(destination) => {
                    info!(message_id, recipient, destination = %destination, "No alias, using default destination");
                    Resolution::Defaulted {
                        destination: destination.clone(),
                    }
                }
                None => {
                    warn!(message_id, recipient, "No alias and no default destination, skipping");
                    Resolution::Skipped {
                        reason: "no alias record".into(),
                    }
                }
            },
            Err(e @ AliasError::InvalidAddress(_)) => {
                warn!(message_id, recipient, error = %e, "Skipping invalid recipient");
                Resolution::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                warn!(message_id, recipient, error = %e, "Alias lookup failed, skipping");
                Resolution::Skipped {
                    reason: e.to_string(),
                }
            }
        };

        // An unparsable destination skips only this recipient.
        let invalid = resolution.destination().and_then(|destination| {
            destination
                .parse::<lettre::Address>()
                .err()
                .map(|e| format!("invalid destination {destination:?}: {e}"))
        });
        if let Some(reason) = invalid {
            warn!(message_id, recipient, reason = %reason, "Skipping invalid destination");
            resolution = Resolution::Skipped { reason };
        }

        let status = match &resolution {
            Resolution::Skipped { reason } => DeliveryStatus::Failed {
                reason: reason.clone(),
            },
            _ => DeliveryStatus::Pending,
        };
        RecipientReport {
            recipient: recipient.to_string(),
            resolution,
            status,
        }
    }
}

fn validate_event(message: &InboundMessage) -> Result<(), String> {
    let id = message.message_id.trim();
    if id.is_empty() {
        return Err("empty message id".into());
    }
    if id.contains('/') || id.contains("..") {
        return Err(format!("invalid message id {id:?}"));
    }
    Ok(())
}

/// Destinations in order of first appearance, compared case-insensitively.
fn unique_destinations(recipients: &[RecipientReport]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for destination in recipients.iter().filter_map(|r| r.resolution.destination()) {
        if !seen.iter().any(|d| d.eq_ignore_ascii_case(destination)) {
            seen.push(destination.to_string());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::alias::MemoryAliasStore;
    use crate::archive::MemoryArchive;
    use crate::error::{ArchiveError, DispatchError};
    use crate::retry::RetryPolicy;

    const RAW: &[u8] = b"From: Alice <alice@sender.example>\r\n\
To: billing@proxy.example\r\n\
Subject: Invoice\r\n\
\r\n\
pay me\r\n";

    // ── Mocks ───────────────────────────────────────────────────────

    #[derive(Default)]
    struct CountingArchive {
        inner: MemoryArchive,
        reads: AtomicU32,
    }

    #[async_trait]
    impl ArchiveStore for CountingArchive {
        async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<ForwardEnvelope>>,
        attempts: AtomicU32,
        fail_with: Mutex<Vec<DispatchError>>,
    }

    impl RecordingSender {
        fn failing(errors: Vec<DispatchError>) -> Self {
            Self {
                fail_with: Mutex::new(errors),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<ForwardEnvelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        async fn send_raw(&self, envelope: &ForwardEnvelope) -> Result<(), DispatchError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_with.lock().unwrap().pop() {
                return Err(err);
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    struct Harness {
        forwarder: Forwarder,
        archive: Arc<CountingArchive>,
        sender: Arc<RecordingSender>,
    }

    fn settings() -> ForwarderSettings {
        ForwarderSettings {
            from_email: "forwarder@proxy.example".into(),
            subject_prefix: None,
            default_destination: None,
            archive_prefix: "inbound".into(),
            max_message_bytes: 1024,
            retry: RetryPolicy::immediate(3),
        }
    }

    async fn harness(
        aliases: &[(&str, &str)],
        settings: ForwarderSettings,
        sender: RecordingSender,
    ) -> Harness {
        let archive = Arc::new(CountingArchive::default());
        archive.inner.put("inbound/msg-1", RAW).await;
        let sender = Arc::new(sender);
        let resolver = AliasResolver::new(
            Arc::new(MemoryAliasStore::from_pairs(aliases.iter().copied())),
            true,
            settings.retry.clone(),
        );
        Harness {
            forwarder: Forwarder::new(resolver, archive.clone(), sender.clone(), settings),
            archive,
            sender,
        }
    }

    fn message(recipients: &[&str]) -> InboundMessage {
        InboundMessage::new(
            "msg-1",
            "bounce@sender.example",
            recipients.iter().map(|r| r.to_string()).collect(),
        )
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn plus_extension_is_forwarded_to_base_alias() {
        let h = harness(
            &[("billing", "ops@realmail.com")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["billing+invoices@proxy.domain"]))
            .await;

        assert!(report.is_success(), "{report:?}");
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ops@realmail.com"]);
        assert_eq!(sent[0].from, "forwarder@proxy.example");
        assert_eq!(
            report.history,
            vec![
                MessageState::Received,
                MessageState::Archived,
                MessageState::AliasResolving,
                MessageState::BodyLoaded,
                MessageState::HeadersRewritten,
                MessageState::Dispatched,
            ]
        );
        assert_eq!(report.recipients[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn one_unmapped_recipient_is_partial_success() {
        let h = harness(
            &[("billing", "ops@realmail.example"), ("sales", "sales@realmail.example")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&[
                "billing@proxy.example",
                "unknown@proxy.example",
                "sales@proxy.example",
            ]))
            .await;

        assert!(report.is_success());
        assert_eq!(report.failed_recipients(), 1);
        assert!(matches!(
            report.recipients[1].resolution,
            Resolution::Skipped { .. }
        ));
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].to,
            vec!["ops@realmail.example", "sales@realmail.example"]
        );
    }

    #[tokio::test]
    async fn only_unmapped_recipient_is_unroutable_without_archive_read() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["unknown@proxy.domain"]))
            .await;

        assert_eq!(report.state, MessageState::Unroutable);
        assert!(!report.is_success());
        assert_eq!(h.archive.reads.load(Ordering::SeqCst), 0);
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_destination_catches_unmapped() {
        let h = harness(
            &[],
            ForwarderSettings {
                default_destination: Some("catchall@realmail.example".into()),
                ..settings()
            },
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["anyone@proxy.example"]))
            .await;

        assert!(report.is_success());
        assert_eq!(
            report.recipients[0].resolution,
            Resolution::Defaulted {
                destination: "catchall@realmail.example".into()
            }
        );
        assert_eq!(h.sender.sent()[0].to, vec!["catchall@realmail.example"]);
    }

    #[tokio::test]
    async fn duplicate_destinations_are_sent_once() {
        let h = harness(
            &[("a", "ops@realmail.example"), ("b", "OPS@realmail.example")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["a@proxy.example", "b@proxy.example"]))
            .await;

        assert!(report.is_success());
        assert_eq!(h.sender.sent()[0].to, vec!["ops@realmail.example"]);
        assert!(
            report
                .recipients
                .iter()
                .all(|r| r.status == DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn missing_body_fails_every_recipient_without_dispatch() {
        let h = harness(
            &[("billing", "ops@realmail.example"), ("sales", "sales@realmail.example")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let mut event = message(&["billing@proxy.example", "sales@proxy.example"]);
        event.message_id = "never-archived".into();
        let report = h.forwarder.forward(&event).await;

        assert_eq!(report.state, MessageState::BodyMissing);
        assert_eq!(report.failed_recipients(), 2);
        assert_eq!(h.archive.reads.load(Ordering::SeqCst), 3);
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn body_that_appears_late_is_picked_up() {
        struct LateArchive {
            reads: AtomicU32,
        }

        #[async_trait]
        impl ArchiveStore for LateArchive {
            async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError> {
                if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ArchiveError::NotFound { key: key.into() });
                }
                Ok(RAW.to_vec())
            }
        }

        let sender = Arc::new(RecordingSender::default());
        let forwarder = Forwarder::new(
            AliasResolver::new(
                Arc::new(MemoryAliasStore::from_pairs([("billing", "ops@realmail.example")])),
                true,
                RetryPolicy::immediate(3),
            ),
            Arc::new(LateArchive {
                reads: AtomicU32::new(0),
            }),
            sender.clone(),
            settings(),
        );

        let report = forwarder.forward(&message(&["billing@proxy.example"])).await;
        assert!(report.is_success());
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            ForwarderSettings {
                max_message_bytes: 10,
                ..settings()
            },
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["billing@proxy.example"]))
            .await;

        assert_eq!(report.state, MessageState::Rejected);
        assert!(report.error.unwrap().contains("too large"));
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            settings(),
            RecordingSender::failing(vec![DispatchError::Rejected {
                reason: "554 Message rejected: Email address is not verified".into(),
            }]),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["billing@proxy.example"]))
            .await;

        assert_eq!(report.state, MessageState::DispatchFailed);
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(report.failed_recipients(), 1);
    }

    #[tokio::test]
    async fn transient_dispatch_failure_is_retried() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            settings(),
            RecordingSender::failing(vec![DispatchError::Transient {
                reason: "421 throttled".into(),
            }]),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["billing@proxy.example"]))
            .await;

        assert!(report.is_success());
        assert_eq!(h.sender.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rewritten_message_carries_marker_and_reply_to() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            ForwarderSettings {
                subject_prefix: Some("[proxy]".into()),
                ..settings()
            },
            RecordingSender::default(),
        )
        .await;
        h.forwarder
            .forward(&message(&["billing@proxy.example"]))
            .await;

        let sent = h.sender.sent();
        let parsed = mail_parser::MessageParser::default()
            .parse(&sent[0].raw)
            .unwrap();
        assert_eq!(parsed.subject(), Some("[proxy] Invoice"));
        assert_eq!(
            parsed
                .reply_to()
                .and_then(|a| a.first())
                .and_then(|a| a.address()),
            Some("alice@sender.example")
        );
    }

    #[tokio::test]
    async fn bad_message_id_is_rejected_before_lookup() {
        let h = harness(
            &[("billing", "ops@realmail.example")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let mut event = message(&["billing@proxy.example"]);
        event.message_id = "../etc/passwd".into();
        let report = h.forwarder.forward(&event).await;

        assert_eq!(report.state, MessageState::Rejected);
        assert_eq!(h.archive.reads.load(Ordering::SeqCst), 0);
        assert_eq!(report.recipients.len(), event.recipients.len());
        assert_eq!(report.failed_recipients(), event.recipients.len());
        assert!(matches!(
            report.recipients[0].resolution,
            Resolution::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_destination_skips_only_that_recipient() {
        let h = harness(
            &[("good", "ops@realmail.example"), ("bad", "ops at realmail")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h
            .forwarder
            .forward(&message(&["good@proxy.example", "bad@proxy.example"]))
            .await;

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.failed_recipients(), 1);
        assert!(matches!(
            report.recipients[1].resolution,
            Resolution::Skipped { .. }
        ));
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ops@realmail.example"]);
    }

    #[tokio::test]
    async fn all_invalid_destinations_are_unroutable() {
        let h = harness(
            &[("bad", "not-an-address")],
            settings(),
            RecordingSender::default(),
        )
        .await;
        let report = h.forwarder.forward(&message(&["bad@proxy.example"])).await;

        assert_eq!(report.state, MessageState::Unroutable);
        assert_eq!(h.archive.reads.load(Ordering::SeqCst), 0);
        assert!(h.sender.sent().is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(MessageState::Dispatched.is_terminal());
        assert!(MessageState::BodyMissing.is_terminal());
        assert!(!MessageState::BodyLoaded.is_terminal());
    }
}
