//! Receiver transport interface.
//!
//! A [`ReceiverHub`] knows who is connected and can push a payload to one
//! receiver on a named channel. Inbound traffic is dispatched to
//! [`MessageHandler`]s registered per channel by the hub implementation.
//!
//! The receiver set belongs to the hub and may change between any two
//! reads. Callers take a fresh [`ReceiverHub::receivers`] list whenever
//! they fan out.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TilecastError;
use crate::wire::{Notice, WireMessage};

/// Identity of a connected receiver, stable for its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(pub u64);

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiver-{}", self.0)
    }
}

pub trait ReceiverHub: Send + Sync {
    /// Receivers connected right now.
    fn receivers(&self) -> Vec<ReceiverId>;

    /// Queue `payload` for `receiver` on `channel`. Does not wait for
    /// delivery.
    fn send(&self, receiver: ReceiverId, channel: &str, payload: Bytes) -> Result<(), TilecastError>;

    /// Tell a receiver something in plain text.
    fn notify(&self, receiver: ReceiverId, text: &str) -> Result<(), TilecastError> {
        let notice = Notice { text: text.to_string() };
        self.send(receiver, Notice::CHANNEL, notice.to_bytes())
    }
}

/// Callback for inbound messages on a channel.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, channel: &str, receiver: ReceiverId, payload: &[u8]);
}

// ── MemoryHub ────────────────────────────────────────────────────

/// A message accepted by a [`MemoryHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub receiver: ReceiverId,
    pub channel: String,
    pub payload: Bytes,
}

/// In-process hub: a mutable receiver list and a log of everything sent.
///
/// [`MemoryHub::tap`] streams sends as they happen, which lets a task play
/// the receivers' side of a conversation.
#[derive(Debug, Default)]
pub struct MemoryHub {
    receivers: RwLock<Vec<ReceiverId>>,
    unreachable: RwLock<HashSet<ReceiverId>>,
    sent: Mutex<Vec<SentMessage>>,
    tap: Mutex<Option<mpsc::UnboundedSender<SentMessage>>>,
}

impl MemoryHub {
    pub fn new(receivers: impl IntoIterator<Item = ReceiverId>) -> Self {
        Self {
            receivers: RwLock::new(receivers.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Hub with receivers `0..count`.
    pub fn with_receivers(count: u64) -> Self {
        Self::new((0..count).map(ReceiverId))
    }

    pub fn connect(&self, receiver: ReceiverId) {
        let mut receivers = self.receivers.write().unwrap_or_else(|e| e.into_inner());
        if !receivers.contains(&receiver) {
            receivers.push(receiver);
        }
    }

    pub fn disconnect(&self, receiver: ReceiverId) {
        self.receivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| *r != receiver);
    }

    /// Make every send to `receiver` fail with a transport error.
    pub fn set_unreachable(&self, receiver: ReceiverId) {
        self.unreachable
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(receiver);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_on(&self, channel: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.channel == channel)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Subscribe to future sends. Replaces any previous tap.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<SentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tap.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }
}

impl ReceiverHub for MemoryHub {
    fn receivers(&self) -> Vec<ReceiverId> {
        self.receivers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn send(&self, receiver: ReceiverId, channel: &str, payload: Bytes) -> Result<(), TilecastError> {
        if self
            .unreachable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&receiver)
        {
            return Err(TilecastError::Transport(format!("{receiver} unreachable")));
        }

        let message = SentMessage {
            receiver,
            channel: channel.to_string(),
            payload,
        };
        if let Some(tap) = self.tap.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tap.send(message.clone());
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(message);
        Ok(())
    }
}
