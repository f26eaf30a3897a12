//! Per-domain consumers that turn change-feed events into local state.

pub mod chat;
pub mod location;
pub mod notices;
pub mod notifications;
pub mod ports;
pub mod requests;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{ChatEntry, ChatSync, MessageDraft, MessageList, TempId};
pub use location::LocationSync;
pub use notices::{NoticeCatalog, NoticeText};
pub use notifications::NotificationSync;
pub use ports::{
    CacheInvalidator, CacheKey, CurrentUser, Notice, NoticeError, NoticeKind, NoticeSink, Refetch,
    SyncDeps, SyncError,
};
pub use requests::{RequestStatusSync, StatusChange, StatusTracker};
pub use views::ViewCounterSync;
