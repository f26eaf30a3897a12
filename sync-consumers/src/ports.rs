use std::sync::Arc;
use sync_core::RequestStatus;
use thiserror::Error;
use uuid::Uuid;

/// Who is looking. Consumers that filter by user fail to start without one.
pub trait CurrentUser: Send + Sync {
    fn user_id(&self) -> Option<Uuid>;
}

impl CurrentUser for Option<Uuid> {
    fn user_id(&self) -> Option<Uuid> {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The current user's active request list.
    Requests,
    Request(Uuid),
    Messages(Uuid),
    Notifications,
    Listing(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refetch {
    /// Re-fetch now, even for views that are already mounted.
    Immediate,
    /// Mark stale and re-fetch on next use.
    Lazy,
}

pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: CacheKey, refetch: Refetch);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    StatusChanged(RequestStatus),
    ReportArrived,
    NewRequest,
}

/// A user-facing toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub description: String,
    pub request_id: Uuid,
}

#[derive(Debug, Error)]
#[error("notice dispatch failed: {0}")]
pub struct NoticeError(pub String);

pub trait NoticeSink: Send + Sync {
    fn dispatch(&self, notice: Notice) -> Result<(), NoticeError>;
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no current user")]
    NoCurrentUser,
}

/// Ports every consumer is constructed with.
#[derive(Clone)]
pub struct SyncDeps {
    pub user: Arc<dyn CurrentUser>,
    pub cache: Arc<dyn CacheInvalidator>,
    pub notices: Arc<dyn NoticeSink>,
}

impl SyncDeps {
    pub fn require_user(&self) -> Result<Uuid, SyncError> {
        self.user.user_id().ok_or(SyncError::NoCurrentUser)
    }
}
