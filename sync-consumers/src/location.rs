use std::collections::HashMap;
use std::sync::Arc;
use sync_core::schema::tables;
use sync_core::LocationRecord;
use sync_feed::{
    ChangeEvent, ChangeFeed, ChangeHandler, ChannelSpec, RetryConfig, RowFilter, Subscription,
    SubscriptionConfig, SubscriptionState,
};
use tokio::sync::watch;
use uuid::Uuid;

pub type LivePositions = HashMap<Uuid, LocationRecord>;

/// Applies one location row change to the live set.
pub fn apply_location(positions: &mut LivePositions, event: &ChangeEvent) -> bool {
    let record = match event.new_record::<LocationRecord>() {
        Ok(Some(record)) => record,
        Ok(None) => {
            // Delete: only the old row is present.
            let Some(user_id) = event
                .before
                .as_ref()
                .and_then(|row| row.get("user_id"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok())
            else {
                return false;
            };
            return positions.remove(&user_id).is_some();
        }
        Err(e) => {
            tracing::warn!("Undecodable location row: {}", e);
            return false;
        }
    };

    if let Some(held) = positions.get(&record.user_id) {
        if held.updated_at > record.updated_at {
            return false;
        }
    }

    if record.is_active {
        positions.insert(record.user_id, record);
        true
    } else {
        positions.remove(&record.user_id).is_some()
    }
}

struct LocationHandler(watch::Sender<LivePositions>);

impl ChangeHandler for LocationHandler {
    fn on_change(&self, event: &ChangeEvent) {
        self.0.send_if_modified(|positions| apply_location(positions, event));
    }
}

/// Live positions shared on one request, keyed by user.
pub struct LocationSync {
    positions: watch::Receiver<LivePositions>,
    subscription: Subscription,
}

impl LocationSync {
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        request_id: Uuid,
        initial: Vec<LocationRecord>,
        retry: RetryConfig,
    ) -> Self {
        let seeded = initial
            .into_iter()
            .filter(|record| record.is_active)
            .map(|record| (record.user_id, record))
            .collect();
        let (tx, positions) = watch::channel(seeded);

        let channel = ChannelSpec::table(format!("locations:{}", request_id), tables::LIVE_LOCATIONS)
            .with_filter(RowFilter::equals("request_id", request_id));
        let subscription = Subscription::create(
            feed,
            SubscriptionConfig::new(channel, Arc::new(LocationHandler(tx))),
            retry,
        );

        Self {
            positions,
            subscription,
        }
    }

    pub fn positions(&self) -> LivePositions {
        self.positions.borrow().clone()
    }

    pub fn position_of(&self, user_id: Uuid) -> Option<LocationRecord> {
        self.positions.borrow().get(&user_id).cloned()
    }

    pub fn watch(&self) -> watch::Receiver<LivePositions> {
        self.positions.clone()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn stop(&self) {
        self.subscription.unsubscribe();
    }
}
