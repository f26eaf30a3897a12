use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_feed::{MemoryFeed, RetryConfig, Row};
use uuid::Uuid;

use crate::ports::{CacheInvalidator, CacheKey, Notice, NoticeError, NoticeSink, Refetch, SyncDeps};

#[derive(Default)]
pub struct RecordingCache {
    pub calls: Mutex<Vec<(CacheKey, Refetch)>>,
}

impl RecordingCache {
    pub fn calls(&self) -> Vec<(CacheKey, Refetch)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CacheInvalidator for RecordingCache {
    fn invalidate(&self, key: CacheKey, refetch: Refetch) {
        self.calls.lock().unwrap().push((key, refetch));
    }
}

#[derive(Default)]
pub struct RecordingNotices {
    pub sent: Mutex<Vec<Notice>>,
    pub fail: AtomicBool,
}

impl RecordingNotices {
    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().unwrap().clone()
    }
}

impl NoticeSink for RecordingNotices {
    fn dispatch(&self, notice: Notice) -> Result<(), NoticeError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NoticeError("toast host unmounted".to_string()));
        }
        self.sent.lock().unwrap().push(notice);
        Ok(())
    }
}

pub struct Harness {
    pub feed: Arc<MemoryFeed>,
    pub cache: Arc<RecordingCache>,
    pub notices: Arc<RecordingNotices>,
    pub me: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            feed: Arc::new(MemoryFeed::new()),
            cache: Arc::new(RecordingCache::default()),
            notices: Arc::new(RecordingNotices::default()),
            me: Uuid::new_v4(),
        }
    }

    pub fn deps(&self) -> SyncDeps {
        SyncDeps {
            user: Arc::new(Some(self.me)),
            cache: self.cache.clone(),
            notices: self.notices.clone(),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::default()
    }

    /// Wait until `name` has a live channel, then let queued signals drain.
    pub async fn wait_live(&self, name: &str) {
        for _ in 0..100 {
            if self.feed.live_channels(name) > 0 {
                settle().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("channel {name} never opened");
    }
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}
