use std::sync::Arc;
use sync_core::schema::tables;
use sync_core::Notification;
use sync_feed::{
    ChangeEvent, ChangeFeed, ChangeHandler, ChannelSpec, RetryConfig, RowFilter, Subscription,
    SubscriptionConfig,
};
use tokio::sync::watch;

use crate::ports::{CacheInvalidator, CacheKey, Refetch, SyncDeps, SyncError};

fn is_unread(row: Option<&sync_feed::Row>) -> Option<bool> {
    let read_at = row?.get("read_at")?;
    Some(read_at.is_null())
}

/// Change in the unread count caused by one notification row event.
pub fn unread_delta(event: &ChangeEvent) -> i64 {
    use sync_feed::EventType::*;

    match event.event_type {
        Insert => match event.new_record::<Notification>() {
            Ok(Some(n)) if n.is_unread() => 1,
            _ => 0,
        },
        Update => match (is_unread(event.before.as_ref()), is_unread(event.after.as_ref())) {
            (Some(true), Some(false)) => -1,
            (Some(false), Some(true)) => 1,
            _ => 0,
        },
        Delete => match is_unread(event.before.as_ref()) {
            Some(true) => -1,
            _ => 0,
        },
    }
}

struct NotificationHandler {
    unread: watch::Sender<u64>,
    cache: Arc<dyn CacheInvalidator>,
}

impl ChangeHandler for NotificationHandler {
    fn on_change(&self, event: &ChangeEvent) {
        let delta = unread_delta(event);
        if delta != 0 {
            self.unread.send_modify(|count| {
                *count = if delta > 0 {
                    count.saturating_add(delta.unsigned_abs())
                } else {
                    count.saturating_sub(delta.unsigned_abs())
                };
            });
        }
        self.cache.invalidate(CacheKey::Notifications, Refetch::Immediate);
    }
}

/// Unread notification count for the current user.
pub struct NotificationSync {
    unread: watch::Receiver<u64>,
    subscription: Subscription,
}

impl NotificationSync {
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        deps: &SyncDeps,
        initial_unread: u64,
        retry: RetryConfig,
    ) -> Result<Self, SyncError> {
        let me = deps.require_user()?;
        let (tx, unread) = watch::channel(initial_unread);

        let channel = ChannelSpec::table(format!("notifications:{}", me), tables::NOTIFICATIONS)
            .with_filter(RowFilter::equals("user_id", me));
        let handler = NotificationHandler {
            unread: tx,
            cache: deps.cache.clone(),
        };
        let subscription = Subscription::create(feed, SubscriptionConfig::new(channel, Arc::new(handler)), retry);

        Ok(Self {
            unread,
            subscription,
        })
    }

    pub fn unread_count(&self) -> u64 {
        *self.unread.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.unread.clone()
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }
}
