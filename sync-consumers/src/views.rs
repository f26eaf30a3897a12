use std::sync::Arc;
use sync_core::schema::tables;
use sync_core::ListingViews;
use sync_feed::{
    ChangeEvent, ChangeFeed, ChangeHandler, ChannelSpec, EventType, EventTypes, RetryConfig,
    RowFilter, Subscription, SubscriptionConfig,
};
use tokio::sync::watch;
use uuid::Uuid;

struct ViewHandler(watch::Sender<Option<i64>>);

impl ChangeHandler for ViewHandler {
    fn on_update(&self, event: &ChangeEvent) {
        match event.new_record::<ListingViews>() {
            Ok(Some(views)) => {
                self.0.send_if_modified(|count| {
                    let changed = *count != Some(views.view_count);
                    *count = Some(views.view_count);
                    changed
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Undecodable listing row: {}", e),
        }
    }
}

/// Latest view count of one listing.
pub struct ViewCounterSync {
    count: watch::Receiver<Option<i64>>,
    subscription: Subscription,
}

impl ViewCounterSync {
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        listing_id: Uuid,
        initial: Option<i64>,
        retry: RetryConfig,
    ) -> Self {
        let (tx, count) = watch::channel(initial);
        let channel = ChannelSpec::table(format!("views:{}", listing_id), tables::LISTINGS)
            .with_filter(RowFilter::equals("id", listing_id))
            .with_events(EventTypes::only(&[EventType::Update]));
        let subscription = Subscription::create(
            feed,
            SubscriptionConfig::new(channel, Arc::new(ViewHandler(tx))),
            retry,
        );
        Self {
            count,
            subscription,
        }
    }

    pub fn view_count(&self) -> Option<i64> {
        *self.count.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Option<i64>> {
        self.count.clone()
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }
}
