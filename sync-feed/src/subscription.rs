use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryConfig;
use crate::event::{ChangeEvent, EventType};
use crate::feed::{ChangeFeed, ChannelSpec, FeedChannel, FeedError, FeedSignal};

/// Receives the events delivered on a subscription.
///
/// Callbacks run on the subscription's task and must not block. The typed
/// callback for an event fires first, then [`ChangeHandler::on_change`].
pub trait ChangeHandler: Send + Sync + 'static {
    fn on_insert(&self, _event: &ChangeEvent) {}
    fn on_update(&self, _event: &ChangeEvent) {}
    fn on_delete(&self, _event: &ChangeEvent) {}
    fn on_change(&self, _event: &ChangeEvent) {}
}

#[derive(Clone)]
pub struct SubscriptionConfig {
    pub channel: ChannelSpec,
    pub handler: Arc<dyn ChangeHandler>,
}

impl SubscriptionConfig {
    pub fn new(channel: ChannelSpec, handler: Arc<dyn ChangeHandler>) -> Self {
        Self { channel, handler }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    /// `attempt` is the 1-based reconnect about to be made after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted. Nothing further happens on this subscription.
    Disconnected,
    Unsubscribed,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Disconnected | SubscriptionState::Unsubscribed)
    }
}

#[derive(Debug, Error)]
enum ChannelFailure {
    #[error("open failed: {0}")]
    Open(FeedError),
    #[error("channel error: {0}")]
    Error(String),
    #[error("channel timed out")]
    Timeout,
    #[error("channel closed")]
    Closed,
}

thread_local! {
    // Address of the `Shared` whose handler is running on this thread.
    static DISPATCHING: Cell<usize> = const { Cell::new(0) };
}

struct Shared {
    channel_name: String,
    closed: AtomicBool,
    /// Release token of the live channel. Taken under this lock by unsubscribe.
    control: Mutex<Option<CancellationToken>>,
    /// Held while handler callbacks run.
    dispatch: Mutex<()>,
    state: watch::Sender<SubscriptionState>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn id(&self) -> usize {
        self as *const Shared as usize
    }

    fn set_state(&self, state: SubscriptionState) {
        let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_closed() {
            self.state.send_replace(state);
        }
    }

    /// Returns `false` if the subscription was torn down while opening.
    fn attach(&self, release: CancellationToken) -> bool {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            release.cancel();
            return false;
        }
        *control = Some(release);
        true
    }

    fn detach(&self) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(release) = control.take() {
            release.cancel();
        }
    }

    fn dispatch(&self, handler: &dyn ChangeHandler, event: &ChangeEvent) {
        let _guard = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return;
        }

        let previous = DISPATCHING.with(|d| d.replace(self.id()));
        match event.event_type {
            EventType::Insert => handler.on_insert(event),
            EventType::Update => handler.on_update(event),
            EventType::Delete => handler.on_delete(event),
        }
        if !self.is_closed() {
            handler.on_change(event);
        }
        DISPATCHING.with(|d| d.set(previous));
    }
}

/// One named channel kept alive across transport failures.
///
/// Failures are retried with jittered exponential backoff until
/// `max_retries` consecutive failures, after which the subscription settles
/// in [`SubscriptionState::Disconnected`]. A delivered event resets the
/// failure count.
pub struct Subscription {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Must be called from within a tokio runtime.
    pub fn create(feed: Arc<dyn ChangeFeed>, config: SubscriptionConfig, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Connecting);
        let shared = Arc::new(Shared {
            channel_name: config.channel.name.clone(),
            closed: AtomicBool::new(false),
            control: Mutex::new(None),
            dispatch: Mutex::new(()),
            state,
        });

        let task = tokio::spawn(run(shared.clone(), feed, config, retry));
        Subscription { shared, task }
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.shared.state.subscribe()
    }

    /// Idempotent. Once this returns, the channel is released, no retry is
    /// pending and no handler callback will run. Safe to call from inside a
    /// handler of this subscription.
    pub fn unsubscribe(&self) {
        {
            let mut control = self.shared.control.lock().unwrap_or_else(|e| e.into_inner());
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(release) = control.take() {
                release.cancel();
            }
            self.shared.state.send_replace(SubscriptionState::Unsubscribed);
        }

        self.task.abort();

        let reentrant = DISPATCHING.with(|d| d.get() == self.shared.id());
        if !reentrant {
            // Wait out a callback already running on another thread.
            drop(self.shared.dispatch.lock().unwrap_or_else(|e| e.into_inner()));
        }

        tracing::debug!("Unsubscribed from channel {}", self.shared.channel_name);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run(
    shared: Arc<Shared>,
    feed: Arc<dyn ChangeFeed>,
    config: SubscriptionConfig,
    retry: RetryConfig,
) {
    let SubscriptionConfig { channel: spec, handler } = config;
    let mut attempt: u32 = 0;

    loop {
        if shared.is_closed() {
            return;
        }

        let failure = match feed.open(&spec).await {
            Ok(mut channel) => {
                if !shared.attach(channel.release_token()) {
                    return;
                }
                let failure = pump(&shared, &mut channel, handler.as_ref(), &mut attempt).await;
                shared.detach();
                failure
            }
            Err(e) => ChannelFailure::Open(e),
        };

        if shared.is_closed() {
            return;
        }

        if attempt >= retry.max_retries {
            tracing::error!(
                "Channel {} disconnected after {} reconnect attempts: {}",
                spec.name,
                attempt,
                failure
            );
            shared.set_state(SubscriptionState::Disconnected);
            return;
        }

        let delay = retry.jittered_delay(attempt);
        attempt += 1;
        tracing::warn!(
            "Channel {} failed ({}), reconnect attempt {}/{} in {:?}",
            spec.name,
            failure,
            attempt,
            retry.max_retries,
            delay
        );
        shared.set_state(SubscriptionState::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
    }
}

async fn pump(
    shared: &Shared,
    channel: &mut FeedChannel,
    handler: &dyn ChangeHandler,
    attempt: &mut u32,
) -> ChannelFailure {
    while let Some(signal) = channel.next().await {
        match signal {
            FeedSignal::Subscribed => {
                tracing::debug!("Channel {} subscribed", shared.channel_name);
                shared.set_state(SubscriptionState::Subscribed);
            }
            FeedSignal::Event(event) => {
                *attempt = 0;
                shared.dispatch(handler, &event);
                if shared.is_closed() {
                    return ChannelFailure::Closed;
                }
            }
            FeedSignal::Error(message) => return ChannelFailure::Error(message),
            FeedSignal::Timeout => return ChannelFailure::Timeout,
            FeedSignal::Closed => return ChannelFailure::Closed,
        }
    }
    ChannelFailure::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFeed;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        total: AtomicUsize,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ChangeHandler for Recorder {
        fn on_insert(&self, _event: &ChangeEvent) {
            self.seen.lock().unwrap().push("insert".to_string());
        }
        fn on_update(&self, _event: &ChangeEvent) {
            self.seen.lock().unwrap().push("update".to_string());
        }
        fn on_delete(&self, _event: &ChangeEvent) {
            self.seen.lock().unwrap().push("delete".to_string());
        }
        fn on_change(&self, _event: &ChangeEvent) {
            self.total.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn insert(id: i64) -> ChangeEvent {
        ChangeEvent::insert("chat_messages", json!({ "id": id }).as_object().cloned().unwrap())
    }

    fn subscribe(feed: &Arc<MemoryFeed>, handler: Arc<dyn ChangeHandler>) -> Subscription {
        Subscription::create(
            feed.clone(),
            SubscriptionConfig::new(ChannelSpec::table("chat", "chat_messages"), handler),
            RetryConfig::default(),
        )
    }

    async fn wait_for_state(sub: &Subscription, wanted: impl Fn(&SubscriptionState) -> bool) {
        let mut rx = sub.watch_state();
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| wanted(s)))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_typed_callbacks_then_on_change() {
        let feed = Arc::new(MemoryFeed::new());
        let recorder = Arc::new(Recorder::default());
        let sub = subscribe(&feed, recorder.clone());
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        let row = json!({ "id": 1 }).as_object().cloned().unwrap();
        feed.publish(insert(1));
        feed.publish(ChangeEvent::update("chat_messages", row.clone(), row.clone()));
        feed.publish(ChangeEvent::delete("chat_messages", row));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.seen(), vec!["insert", "update", "delete"]);
        assert_eq!(recorder.total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let feed = Arc::new(MemoryFeed::new());
        feed.set_refuse_all(true);
        let sub = subscribe(&feed, Arc::new(Recorder::default()));

        wait_for_state(&sub, |s| *s == SubscriptionState::Disconnected).await;
        assert_eq!(feed.open_count("chat"), 6);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(feed.open_count("chat"), 6);
        assert_eq!(sub.state(), SubscriptionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_channel_error() {
        let feed = Arc::new(MemoryFeed::new());
        let recorder = Arc::new(Recorder::default());
        let sub = subscribe(&feed, recorder.clone());
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        feed.fail_channel("chat", "socket reset");
        wait_for_state(&sub, |s| matches!(s, SubscriptionState::Reconnecting { attempt: 1, .. })).await;
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;
        assert_eq!(feed.open_count("chat"), 2);
        assert_eq!(feed.live_channels("chat"), 1);

        feed.publish(insert(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.seen(), vec!["insert"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_event_resets_attempts() {
        let feed = Arc::new(MemoryFeed::new());
        let sub = subscribe(&feed, Arc::new(Recorder::default()));
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        feed.time_out_channel("chat");
        wait_for_state(&sub, |s| matches!(s, SubscriptionState::Reconnecting { attempt: 1, .. })).await;
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        // A second failure without an event in between counts up.
        feed.close_channel("chat");
        wait_for_state(&sub, |s| matches!(s, SubscriptionState::Reconnecting { attempt: 2, .. })).await;
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        feed.publish(insert(3));
        tokio::time::sleep(Duration::from_millis(10)).await;

        feed.close_channel("chat");
        wait_for_state(&sub, |s| *s != SubscriptionState::Subscribed).await;
        assert!(matches!(sub.state(), SubscriptionState::Reconnecting { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callbacks_or_retries_after_unsubscribe() {
        let feed = Arc::new(MemoryFeed::new());
        let recorder = Arc::new(Recorder::default());
        let sub = subscribe(&feed, recorder.clone());
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        feed.fail_channel("chat", "boom");
        wait_for_state(&sub, |s| matches!(s, SubscriptionState::Reconnecting { .. })).await;
        sub.unsubscribe();

        tokio::time::sleep(Duration::from_secs(60)).await;
        feed.publish(insert(4));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(feed.open_count("chat"), 1);
        assert_eq!(recorder.total.load(Ordering::SeqCst), 0);
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_releases_channel_before_returning() {
        let feed = Arc::new(MemoryFeed::new());
        let sub = subscribe(&feed, Arc::new(Recorder::default()));
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;
        assert_eq!(feed.live_channels("chat"), 1);

        sub.unsubscribe();
        assert_eq!(feed.live_channels("chat"), 0);

        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    struct SelfClosing {
        subscription: OnceLock<Arc<Subscription>>,
        calls: AtomicUsize,
    }

    impl ChangeHandler for SelfClosing {
        fn on_insert(&self, _event: &ChangeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = self.subscription.get() {
                sub.unsubscribe();
            }
        }
        fn on_change(&self, _event: &ChangeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_from_inside_handler() {
        let feed = Arc::new(MemoryFeed::new());
        let handler = Arc::new(SelfClosing {
            subscription: OnceLock::new(),
            calls: AtomicUsize::new(0),
        });
        let sub = Arc::new(subscribe(&feed, handler.clone()));
        let _ = handler.subscription.set(sub.clone());
        wait_for_state(&sub, |s| *s == SubscriptionState::Subscribed).await;

        feed.publish(insert(5));
        feed.publish(insert(6));
        wait_for_state(&sub, |s| *s == SubscriptionState::Unsubscribed).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // on_change is skipped and the second insert is never delivered.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(feed.live_channels("chat"), 0);
    }
}
