use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use sync_core::{ListingRequest, RequestStatus};
use uuid::Uuid;

use crate::store::{ExpiryBatch, ExpiryCandidate, ExpiryOutcome, NewNotification, RequestStore, StoreError};

/// In-process store with the same update semantics. Used in tests and for
/// running the API without a database.
#[derive(Default)]
pub struct MemoryRequestStore {
    requests: Mutex<Vec<ListingRequest>>,
    notifications: Mutex<Vec<NewNotification>>,
    unavailable: AtomicBool,
    fail_accepted_query: AtomicBool,
}

impl MemoryRequestStore {
    pub fn new(requests: Vec<ListingRequest>) -> Self {
        Self {
            requests: Mutex::new(requests),
            ..Self::default()
        }
    }

    pub fn insert(&self, request: ListingRequest) {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(request);
    }

    pub fn request(&self, id: Uuid) -> Option<ListingRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn notifications(&self) -> Vec<NewNotification> {
        self.notifications.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_accepted_query(&self, fail: bool) {
        self.fail_accepted_query.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn select(&self, predicate: impl Fn(&ListingRequest) -> bool) -> Vec<ExpiryCandidate> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| predicate(r))
            .map(ExpiryCandidate::from)
            .collect()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExpiryCandidate>, StoreError> {
        self.check_available()?;
        Ok(self.select(|r| r.status == RequestStatus::Pending && r.created_at < cutoff))
    }

    async fn accepted_with_preferred_date(&self) -> Result<Vec<ExpiryCandidate>, StoreError> {
        self.check_available()?;
        if self.fail_accepted_query.load(Ordering::SeqCst) {
            return Err(StoreError::Query("canceling statement due to statement timeout".to_string()));
        }
        Ok(self.select(|r| r.status == RequestStatus::Accepted && r.preferred_date.is_some()))
    }

    async fn expire(&self, batch: ExpiryBatch) -> Result<ExpiryOutcome, StoreError> {
        self.check_available()?;
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = 0;
        for request in requests.iter_mut().filter(|r| batch.ids.contains(&r.id)) {
            request.status = batch.status;
            request.provider_response = Some(batch.provider_response.clone());
            updated += 1;
        }

        let count = batch.notifications.len();
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(batch.notifications);

        Ok(ExpiryOutcome {
            updated,
            notifications: count,
        })
    }
}
