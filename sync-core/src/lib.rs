pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod redis;
pub mod schema;
pub mod status;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::SyncContext;
pub use db::DbPool;
pub use redis::RedisPool;
pub use status::{RequestAction, RequestStatus, TransitionError};
pub use types::{ChatMessage, ListingRequest, ListingViews, LocationRecord, Notification};
