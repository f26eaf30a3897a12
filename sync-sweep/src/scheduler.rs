use std::sync::Arc;
use std::time::Duration;

use crate::sweep::Sweeper;

/// Runs the sweep every `interval` until the task is dropped.
pub async fn run(sweeper: Arc<Sweeper>, interval: Duration) {
    tracing::info!("Starting expiration sweep every {:?}", interval);

    loop {
        match sweeper.run().await {
            Ok(report) => {
                for error in &report.errors {
                    tracing::warn!("Sweep error: {}", error);
                }
            }
            Err(e) => {
                tracing::error!("Error in expiration sweep: {}", e);
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRequestStore;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use sync_core::config::SweepConfig;
    use sync_core::{ListingRequest, ManualClock, RequestStatus};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_picks_up_requests_as_they_age() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let request = ListingRequest {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            status: RequestStatus::Pending,
            created_at: created,
            preferred_date: None,
            preferred_time: None,
            provider_response: None,
            completion_description: None,
            completion_photos: None,
        };
        let store = Arc::new(MemoryRequestStore::new(vec![request.clone()]));
        let clock = Arc::new(ManualClock::new(created + ChronoDuration::hours(23)));
        let sweeper = Arc::new(Sweeper::new(store.clone(), clock.clone(), SweepConfig::default()));

        let task = tokio::spawn(run(sweeper, Duration::from_secs(900)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.request(request.id).unwrap().status, RequestStatus::Pending);

        clock.advance(ChronoDuration::hours(2));
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(
            store.request(request.id).unwrap().status,
            RequestStatus::CancelledByProvider
        );
        task.abort();
    }
}
