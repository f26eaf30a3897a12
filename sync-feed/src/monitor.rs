use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_core::config::RealtimeConfig;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::RetryConfig;
use crate::feed::{ChangeFeed, ChannelSpec, FeedChannel, FeedSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub channel_name: String,
    pub retry: RetryConfig,
    /// How long a degraded status must persist before it is surfaced.
    pub debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_name: "heartbeat".to_string(),
            retry: RetryConfig::default(),
            debounce: Duration::from_secs(2),
        }
    }
}

impl From<&RealtimeConfig> for MonitorConfig {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            retry: RetryConfig::from(config),
            debounce: Duration::from_millis(config.debounce_ms),
            ..Self::default()
        }
    }
}

struct Shared {
    status: watch::Sender<ConnectionStatus>,
    reconnect: Notify,
    /// Set while a manual reconnect is requested but not yet acted on.
    reconnect_pending: AtomicBool,
    attempt: AtomicU32,
}

impl Shared {
    fn set(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn request_reconnect(&self) {
        if !self.reconnect_pending.swap(true, Ordering::AcqRel) {
            self.reconnect.notify_one();
        }
    }

    async fn reconnect_requested(&self) {
        self.reconnect.notified().await;
        self.reconnect_pending.store(false, Ordering::Release);
    }
}

/// Classifies overall connectivity from one dedicated presence channel.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
    debounced: watch::Receiver<ConnectionStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionMonitor {
    /// Must be called from within a tokio runtime.
    pub fn start(feed: Arc<dyn ChangeFeed>, config: MonitorConfig) -> Self {
        let (status, raw) = watch::channel(ConnectionStatus::Connecting);
        let (debounced_tx, debounced) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            status,
            reconnect: Notify::new(),
            reconnect_pending: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
        });

        let tasks = vec![
            tokio::spawn(supervise(shared.clone(), feed, config.clone())),
            tokio::spawn(debounce(raw, debounced_tx, config.debounce)),
        ];

        ConnectionMonitor {
            shared,
            debounced,
            tasks,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == ConnectionStatus::Reconnecting
    }

    /// Consecutive failures since the heartbeat channel was last live.
    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::Acquire)
    }

    /// Reset the retry count and reconnect now, skipping any pending backoff.
    /// Requests made before the monitor acts on the first one are coalesced.
    pub fn reconnect(&self) {
        tracing::info!("Manual reconnect requested");
        self.shared.request_reconnect();
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Status for display: degraded states only appear once they have
    /// lasted the debounce window.
    pub fn debounced_status(&self) -> ConnectionStatus {
        *self.debounced.borrow()
    }

    pub fn watch_debounced(&self) -> watch::Receiver<ConnectionStatus> {
        self.debounced.clone()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

enum Outcome {
    Failed(String),
    Manual,
}

async fn supervise(shared: Arc<Shared>, feed: Arc<dyn ChangeFeed>, config: MonitorConfig) {
    let spec = ChannelSpec::presence(config.channel_name.clone());
    let retry = config.retry;

    loop {
        let outcome = match feed.open(&spec).await {
            Ok(mut channel) => watch_channel(&shared, &mut channel).await,
            Err(e) => Outcome::Failed(e.to_string()),
        };

        let reason = match outcome {
            Outcome::Manual => {
                shared.attempt.store(0, Ordering::Release);
                shared.set(ConnectionStatus::Reconnecting);
                continue;
            }
            Outcome::Failed(reason) => reason,
        };

        shared.set(ConnectionStatus::Disconnected);
        let attempt = shared.attempt.load(Ordering::Acquire);

        if attempt >= retry.max_retries {
            tracing::error!(
                "Heartbeat channel {} disconnected after {} attempts: {}",
                spec.name,
                attempt,
                reason
            );
            shared.reconnect_requested().await;
        } else {
            let delay = retry.jittered_delay(attempt);
            shared.attempt.store(attempt + 1, Ordering::Release);
            tracing::warn!(
                "Heartbeat channel {} lost ({}), attempt {}/{} in {:?}",
                spec.name,
                reason,
                attempt + 1,
                retry.max_retries,
                delay
            );
            shared.set(ConnectionStatus::Reconnecting);

            tokio::select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = shared.reconnect_requested() => {}
            }
        }

        shared.attempt.store(0, Ordering::Release);
        shared.set(ConnectionStatus::Reconnecting);
    }
}

async fn watch_channel(shared: &Shared, channel: &mut FeedChannel) -> Outcome {
    loop {
        tokio::select! {
            signal = channel.next() => match signal {
                Some(FeedSignal::Subscribed) => {
                    if shared.status.borrow().is_degraded() {
                        tracing::info!("Heartbeat channel live again");
                    }
                    shared.attempt.store(0, Ordering::Release);
                    shared.set(ConnectionStatus::Connected);
                }
                Some(FeedSignal::Event(_)) => {}
                Some(FeedSignal::Error(message)) => return Outcome::Failed(message),
                Some(FeedSignal::Timeout) => return Outcome::Failed("timed out".to_string()),
                Some(FeedSignal::Closed) | None => return Outcome::Failed("closed".to_string()),
            },
            _ = shared.reconnect_requested() => return Outcome::Manual,
        }
    }
}

async fn debounce(
    mut raw: watch::Receiver<ConnectionStatus>,
    out: watch::Sender<ConnectionStatus>,
    window: Duration,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let current = *raw.borrow_and_update();
        if !current.is_degraded() {
            deadline = None;
            out.send_replace(current);
        } else if out.borrow().is_degraded() {
            out.send_replace(current);
        } else if deadline.is_none() {
            deadline = Some(Instant::now() + window);
        }

        match deadline {
            Some(at) => tokio::select! {
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    let latest = *raw.borrow();
                    if latest.is_degraded() {
                        out.send_replace(latest);
                    }
                }
            },
            None => {
                if raw.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
