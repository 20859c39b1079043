//! SMTP capture server and its HTTP inspection API

pub mod inspect;
pub mod server;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub use server::SmtpServer;

/// One message received over SMTP
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub from: String,
    pub rcpt: Vec<String>,
    pub received_at: DateTime<Utc>,
    /// Raw RFC-822 data as transmitted after DATA, dot-unstuffed
    pub raw: Vec<u8>,
}

/// Messages captured by a fixture's SMTP listener
#[derive(Debug, Default)]
pub struct SmtpStore {
    messages: RwLock<Vec<CapturedMessage>>,
}

impl SmtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: CapturedMessage) {
        self.messages.write().push(message);
    }

    pub fn get(&self, index: usize) -> Option<CapturedMessage> {
        self.messages.read().get(index).cloned()
    }

    pub fn all(&self) -> Vec<CapturedMessage> {
        self.messages.read().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.read().len()
    }
}
