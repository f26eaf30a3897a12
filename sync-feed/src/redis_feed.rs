use async_trait::async_trait;
use redis::streams::{StreamRangeReply, StreamReadReply};
use redis::RedisResult;
use std::time::Duration;
use sync_core::config::RealtimeConfig;
use sync_core::redis::{get_connection, RedisConnection, RedisPool};

use crate::event::ChangeEvent;
use crate::feed::{
    ChangeFeed, ChannelSpec, FeedChannel, FeedError, FeedSender, FeedSignal, DEFAULT_CHANNEL_CAPACITY,
};

const READ_BATCH: usize = 100;

/// Change feed backed by Redis streams, one stream per table at
/// `<prefix>:<table>`. Each entry carries the JSON change event in its
/// `data` field. Presence channels are a periodic PING.
pub struct RedisFeed {
    client: RedisPool,
    stream_prefix: String,
    block_ms: u64,
    heartbeat: Duration,
}

impl RedisFeed {
    pub fn new(client: RedisPool, config: &RealtimeConfig) -> Self {
        Self {
            client,
            stream_prefix: config.stream_prefix.clone(),
            block_ms: 5000,
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn stream_key(&self, table: &str) -> String {
        format!("{}:{}", self.stream_prefix, table)
    }
}

#[async_trait]
impl ChangeFeed for RedisFeed {
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, FeedError> {
        let conn = get_connection(&self.client)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (sender, channel) = FeedChannel::pair(DEFAULT_CHANNEL_CAPACITY);
        match &spec.table {
            Some(table) => {
                let key = self.stream_key(table);
                tracing::debug!("Opening channel {} on stream {}", spec.name, key);
                tokio::spawn(read_stream(conn, key, spec.clone(), self.block_ms, sender));
            }
            None => {
                tokio::spawn(heartbeat(conn, self.heartbeat, sender));
            }
        }
        Ok(channel)
    }
}

async fn latest_id(conn: &mut RedisConnection, key: &str) -> RedisResult<String> {
    let reply: StreamRangeReply = redis::cmd("XREVRANGE")
        .arg(key)
        .arg("+")
        .arg("-")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await?;
    Ok(reply
        .ids
        .first()
        .map(|entry| entry.id.clone())
        .unwrap_or_else(|| "0-0".to_string()))
}

async fn xread(
    conn: &mut RedisConnection,
    key: &str,
    last_id: &str,
    block_ms: u64,
) -> RedisResult<Option<StreamReadReply>> {
    redis::cmd("XREAD")
        .arg("BLOCK")
        .arg(block_ms)
        .arg("COUNT")
        .arg(READ_BATCH)
        .arg("STREAMS")
        .arg(key)
        .arg(last_id)
        .query_async(conn)
        .await
}

fn decode_payload(key: &str, data: &str) -> Option<ChangeEvent> {
    match serde_json::from_str::<ChangeEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Skipping malformed change event on {}: {}", key, e);
            None
        }
    }
}

async fn read_stream(
    mut conn: RedisConnection,
    key: String,
    spec: ChannelSpec,
    block_ms: u64,
    sender: FeedSender,
) {
    // Only changes made after the channel opened are delivered.
    let mut last_id = match latest_id(&mut conn, &key).await {
        Ok(id) => id,
        Err(e) => {
            sender.send(FeedSignal::Error(e.to_string())).await;
            return;
        }
    };

    if !sender.send(FeedSignal::Subscribed).await {
        return;
    }

    loop {
        let reply = tokio::select! {
            _ = sender.released() => return,
            reply = xread(&mut conn, &key, &last_id, block_ms) => reply,
        };

        let reply = match reply {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Stream read failed on {} for channel {}: {}", key, spec.name, e);
                sender.send(FeedSignal::Error(e.to_string())).await;
                return;
            }
        };

        for stream in reply.keys {
            for entry in stream.ids {
                last_id = entry.id.clone();
                let Some(data) = entry.get::<String>("data") else {
                    continue;
                };
                let Some(event) = decode_payload(&key, &data) else {
                    continue;
                };
                if spec.accepts(&event) && !sender.send(FeedSignal::Event(event)).await {
                    return;
                }
            }
        }
    }
}

async fn ping(conn: &mut RedisConnection) -> RedisResult<()> {
    let _pong: String = redis::cmd("PING").query_async(conn).await?;
    Ok(())
}

async fn heartbeat(mut conn: RedisConnection, interval: Duration, sender: FeedSender) {
    if let Err(e) = ping(&mut conn).await {
        sender.send(FeedSignal::Error(e.to_string())).await;
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

        match tokio::time::timeout(interval, ping(&mut conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                sender.send(FeedSignal::Error(e.to_string())).await;
                return;
            }
            Err(_) => {
                sender.send(FeedSignal::Timeout).await;
                return;
            }
        }
    }
}
