use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::event::ChangeEvent;
use crate::feed::{
    ChangeFeed, ChannelSpec, DeliveryError, FeedChannel, FeedError, FeedSender, FeedSignal,
    DEFAULT_CHANNEL_CAPACITY,
};

/// In-process change feed. Events published here fan out to every live
/// channel whose spec accepts them; failures can be injected per channel.
#[derive(Default)]
pub struct MemoryFeed {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: Vec<(ChannelSpec, FeedSender)>,
    opens: HashMap<String, usize>,
    refuse_remaining: usize,
    refuse_all: bool,
    dropped: usize,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse the next `n` open calls.
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse_remaining = n;
    }

    pub fn set_refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Returns how many channels the event was delivered to. Events that hit
    /// a full channel buffer are logged and counted in [`MemoryFeed::dropped`].
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut inner = self.lock();
        inner.channels.retain(|(_, sender)| !sender.is_released());

        let mut delivered = 0;
        let mut dropped = 0;
        for (spec, sender) in inner.channels.iter().filter(|(spec, _)| spec.accepts(&event)) {
            match sender.try_deliver(FeedSignal::Event(event.clone())) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => {
                    tracing::warn!("Memory feed dropped {} event for channel {}: buffer full", event.table, spec.name);
                    dropped += 1;
                }
                Err(DeliveryError::Released) => {}
            }
        }
        inner.dropped += dropped;
        delivered
    }

    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    pub fn fail_channel(&self, name: &str, message: &str) {
        self.end_channel(name, FeedSignal::Error(message.to_string()));
    }

    pub fn time_out_channel(&self, name: &str) {
        self.end_channel(name, FeedSignal::Timeout);
    }

    pub fn close_channel(&self, name: &str) {
        self.end_channel(name, FeedSignal::Closed);
    }

    fn end_channel(&self, name: &str, signal: FeedSignal) {
        let mut inner = self.lock();
        inner.channels.retain(|(spec, sender)| {
            if spec.name == name {
                sender.try_send(signal.clone());
                false
            } else {
                true
            }
        });
    }

    pub fn open_count(&self, name: &str) -> usize {
        self.lock().opens.get(name).copied().unwrap_or(0)
    }

    pub fn live_channels(&self, name: &str) -> usize {
        self.lock()
            .channels
            .iter()
            .filter(|(spec, sender)| spec.name == name && !sender.is_released())
            .count()
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, FeedError> {
        let mut inner = self.lock();
        *inner.opens.entry(spec.name.clone()).or_default() += 1;

        if inner.refuse_all {
            return Err(FeedError::Refused(spec.name.clone()));
        }
        if inner.refuse_remaining > 0 {
            inner.refuse_remaining -= 1;
            return Err(FeedError::Refused(spec.name.clone()));
        }

        let (sender, channel) = FeedChannel::pair(DEFAULT_CHANNEL_CAPACITY);
        sender.try_send(FeedSignal::Subscribed);
        inner.channels.retain(|(_, s)| !s.is_released());
        inner.channels.push((spec.clone(), sender));
        Ok(channel)
    }
}
