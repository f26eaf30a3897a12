//! Change-feed plumbing: the transport-agnostic [`ChangeFeed`] capability, its
//! adapters, and the reconnecting [`Subscription`] and [`ConnectionMonitor`]
//! built on top of it.

pub mod backoff;
pub mod event;
pub mod feed;
pub mod filter;
pub mod memory;
pub mod monitor;
pub mod redis_feed;
#[cfg(feature = "redpanda")]
pub mod redpanda_feed;
pub mod subscription;

pub use backoff::RetryConfig;
pub use event::{ChangeEvent, EventType, EventTypes, Row};
pub use feed::{ChangeFeed, ChannelSpec, DeliveryError, FeedChannel, FeedError, FeedSender, FeedSignal};
pub use filter::{FilterError, RowFilter};
pub use memory::MemoryFeed;
pub use monitor::{ConnectionMonitor, ConnectionStatus, MonitorConfig};
pub use redis_feed::RedisFeed;
#[cfg(feature = "redpanda")]
pub use redpanda_feed::RedpandaFeed;
pub use subscription::{ChangeHandler, Subscription, SubscriptionConfig, SubscriptionState};
