use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use sync_core::config::RealtimeConfig;

use crate::event::ChangeEvent;
use crate::feed::{
    ChangeFeed, ChannelSpec, FeedChannel, FeedError, FeedSender, FeedSignal, DEFAULT_CHANNEL_CAPACITY,
};

/// Change feed backed by Redpanda CDC topics, one `cdc.<table>` topic per
/// table. Each channel gets its own consumer group so channels never share
/// partitions.
pub struct RedpandaFeed {
    brokers: String,
    consumer_group: String,
    heartbeat: Duration,
}

impl RedpandaFeed {
    pub fn new(brokers: impl Into<String>, config: &RealtimeConfig) -> Self {
        Self {
            brokers: brokers.into(),
            consumer_group: config.redpanda_consumer_group.clone(),
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
        }
    }

    pub fn topic(table: &str) -> String {
        format!("cdc.{}", table)
    }

    fn client_config(&self, group: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("socket.keepalive.enable", "true")
            .set("broker.address.family", "v4");

        if let Ok(ssl_enabled) = std::env::var("REDPANDA_SSL_ENABLED") {
            if ssl_enabled == "true" || ssl_enabled == "1" {
                client_config.set("security.protocol", "ssl");
                if let Ok(ca_location) = std::env::var("REDPANDA_SSL_CA_LOCATION") {
                    client_config.set("ssl.ca.location", &ca_location);
                }
            }
        }

        client_config
    }

    fn consumer(&self, channel: &str) -> Result<StreamConsumer, FeedError> {
        let group = format!("{}-{}", self.consumer_group, channel);
        self.client_config(&group).create().map_err(|e| {
            tracing::error!("Failed to create Redpanda consumer for {}: {}", channel, e);
            FeedError::Connect(e.to_string())
        })
    }
}

#[async_trait]
impl ChangeFeed for RedpandaFeed {
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, FeedError> {
        let consumer = Arc::new(self.consumer(&spec.name)?);
        let (sender, channel) = FeedChannel::pair(DEFAULT_CHANNEL_CAPACITY);

        match &spec.table {
            Some(table) => {
                let topic = Self::topic(table);
                consumer
                    .subscribe(&[topic.as_str()])
                    .map_err(|e| FeedError::Refused(e.to_string()))?;
                tracing::debug!("Channel {} subscribed to topic {}", spec.name, topic);
                tokio::spawn(consume(consumer, spec.clone(), sender));
            }
            None => {
                tokio::spawn(probe(consumer, self.heartbeat, sender));
            }
        }
        Ok(channel)
    }
}

async fn consume(consumer: Arc<StreamConsumer>, spec: ChannelSpec, sender: FeedSender) {
    if !sender.send(FeedSignal::Subscribed).await {
        return;
    }

    loop {
        let message = tokio::select! {
            _ = sender.released() => return,
            message = consumer.recv() => message,
        };

        let event = match message {
            Ok(message) => {
                let Some(payload) = message.payload() else {
                    continue;
                };
                match serde_json::from_slice::<ChangeEvent>(payload) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("Skipping malformed change event on {}: {}", spec.name, e);
                        continue;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Error receiving from Redpanda on {}: {}", spec.name, e);
                sender.send(FeedSignal::Error(e.to_string())).await;
                return;
            }
        };

        if spec.accepts(&event) && !sender.send(FeedSignal::Event(event)).await {
            return;
        }
    }
}

async fn fetch_metadata(consumer: Arc<StreamConsumer>, timeout: Duration) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        consumer
            .fetch_metadata(None, timeout)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

async fn probe(consumer: Arc<StreamConsumer>, interval: Duration, sender: FeedSender) {
    if let Err(e) = fetch_metadata(consumer.clone(), interval).await {
        sender.send(FeedSignal::Error(e)).await;
        return;
    }
    if !sender.send(FeedSignal::Subscribed).await {
        return;
    }

    loop {
        tokio::select! {
            _ = sender.released() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = fetch_metadata(consumer.clone(), interval).await {
            tracing::warn!("Redpanda metadata probe failed: {}", e);
            sender.send(FeedSignal::Timeout).await;
            return;
        }
    }
}
