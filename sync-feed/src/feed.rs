use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::{ChangeEvent, EventTypes};
use crate::filter::RowFilter;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("change feed unreachable: {0}")]
    Connect(String),
    #[error("channel refused: {0}")]
    Refused(String),
    #[error("invalid channel spec: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("channel buffer full")]
    Full,
    #[error("channel released")]
    Released,
}

/// What a named channel listens to. A channel without a table is a pure
/// presence (heartbeat) channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub table: Option<String>,
    pub filter: Option<RowFilter>,
    pub events: EventTypes,
}

impl ChannelSpec {
    pub fn table(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Some(table.into()),
            filter: None,
            events: EventTypes::ALL,
        }
    }

    pub fn presence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            filter: None,
            events: EventTypes::ALL,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_events(mut self, events: EventTypes) -> Self {
        self.events = events;
        self
    }

    pub fn is_presence(&self) -> bool {
        self.table.is_none()
    }

    /// Table, event-type and row-filter check shared by every adapter.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        let Some(table) = &self.table else {
            return false;
        };
        if *table != event.table || !self.events.contains(event.event_type) {
            return false;
        }
        match &self.filter {
            Some(filter) => event.subject().map(|row| filter.matches(row)).unwrap_or(false),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// The channel is live.
    Subscribed,
    Event(ChangeEvent),
    /// Terminal: the channel failed and will deliver nothing more.
    Error(String),
    /// Terminal: the transport stopped answering.
    Timeout,
    /// Terminal: the channel was closed by the transport.
    Closed,
}

impl FeedSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedSignal::Error(_) | FeedSignal::Timeout | FeedSignal::Closed)
    }
}

/// Consumer end of an open channel. Cancelling the release token (or
/// dropping the channel) tells the adapter to tear the channel down.
#[derive(Debug)]
pub struct FeedChannel {
    signals: mpsc::Receiver<FeedSignal>,
    release: CancellationToken,
}

/// Adapter end of an open channel.
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedSignal>,
    release: CancellationToken,
}

impl FeedChannel {
    pub fn pair(capacity: usize) -> (FeedSender, FeedChannel) {
        let (tx, signals) = mpsc::channel(capacity);
        let release = CancellationToken::new();
        (
            FeedSender {
                tx,
                release: release.clone(),
            },
            FeedChannel { signals, release },
        )
    }

    pub async fn next(&mut self) -> Option<FeedSignal> {
        if self.release.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.release.cancelled() => None,
            signal = self.signals.recv() => signal,
        }
    }

    pub fn release_token(&self) -> CancellationToken {
        self.release.clone()
    }

    pub fn release(&self) {
        self.release.cancel();
    }
}

impl Drop for FeedChannel {
    fn drop(&mut self) {
        self.release.cancel();
    }
}

impl FeedSender {
    /// Returns `false` once the consumer has released the channel.
    pub async fn send(&self, signal: FeedSignal) -> bool {
        if self.is_released() {
            return false;
        }
        self.tx.send(signal).await.is_ok()
    }

    pub fn try_send(&self, signal: FeedSignal) -> bool {
        match self.try_deliver(signal) {
            Ok(()) => true,
            Err(DeliveryError::Full) => {
                tracing::warn!("Feed channel buffer full, dropping signal");
                false
            }
            Err(DeliveryError::Released) => false,
        }
    }

    pub fn try_deliver(&self, signal: FeedSignal) -> Result<(), DeliveryError> {
        if self.is_released() {
            return Err(DeliveryError::Released);
        }
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Released,
        })
    }

    pub fn is_released(&self) -> bool {
        self.release.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the consumer releases or drops the channel.
    pub async fn released(&self) {
        tokio::select! {
            _ = self.release.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// A push-capable change feed.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Open a channel. The first signal on a healthy channel is
    /// [`FeedSignal::Subscribed`].
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn row(value: serde_json::Value) -> crate::event::Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_spec_accepts_by_table_filter_and_type() {
        let spec = ChannelSpec::table("chat:1", "chat_messages")
            .with_filter(RowFilter::equals("request_id", "1"))
            .with_events(EventTypes::only(&[EventType::Insert]));

        let matching = ChangeEvent::insert("chat_messages", row(json!({ "request_id": "1" })));
        let other_request = ChangeEvent::insert("chat_messages", row(json!({ "request_id": "2" })));
        let other_table = ChangeEvent::insert("listings", row(json!({ "request_id": "1" })));
        let update = ChangeEvent::update(
            "chat_messages",
            row(json!({ "request_id": "1" })),
            row(json!({ "request_id": "1" })),
        );

        assert!(spec.accepts(&matching));
        assert!(!spec.accepts(&other_request));
        assert!(!spec.accepts(&other_table));
        assert!(!spec.accepts(&update));
        assert!(!ChannelSpec::presence("heartbeat").accepts(&matching));
    }

    #[tokio::test]
    async fn test_release_ends_channel() {
        let (sender, mut channel) = FeedChannel::pair(4);
        assert!(sender.send(FeedSignal::Subscribed).await);
        assert_eq!(channel.next().await, Some(FeedSignal::Subscribed));

        channel.release();
        assert!(sender.is_released());
        assert!(!sender.send(FeedSignal::Closed).await);
        assert_eq!(channel.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_releases_sender() {
        let (sender, channel) = FeedChannel::pair(4);
        drop(channel);
        sender.released().await;
        assert!(sender.is_released());
    }
}
