//! Mail transports. Production deployments plug an SMTP or API client in
//! behind [`Transport`]; the implementations here log or capture messages.

use campaign_core::TransportError;
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::info;

use crate::email::EmailMessage;

/// Hands a built message to a delivery service. No implicit retry.
pub trait Transport: Send + Sync {
    fn send(&self, message: &EmailMessage) -> Result<(), TransportError>;
}

/// Transport that only logs each message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        info!(
            message_id = %message.id,
            from = %message.from,
            to = ?message.to,
            subject = %message.subject,
            html = message.html().is_some(),
            "Email handed to log transport"
        );
        metrics::counter!("drip.transport.logged").increment(1);
        Ok(())
    }
}

/// In-memory transport that captures messages and can be told to fail for
/// specific recipients.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `recipient` fail.
    pub fn fail_for(&self, recipient: impl Into<String>) {
        self.failing.lock().insert(recipient.into());
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        let failing = self.failing.lock();
        if let Some(recipient) = message.to.iter().find(|to| failing.contains(*to)) {
            return Err(TransportError::new(recipient.clone(), "recipient rejected"));
        }
        drop(failing);
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
