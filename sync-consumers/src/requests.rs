use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_core::schema::tables;
use sync_core::{ListingRequest, RequestStatus};
use sync_feed::{
    ChangeEvent, ChangeFeed, ChangeHandler, ChannelSpec, RetryConfig, RowFilter, Subscription,
    SubscriptionConfig, SubscriptionState,
};
use uuid::Uuid;

use crate::notices::{NoticeCatalog, NoticeText};
use crate::ports::{CacheKey, Notice, NoticeKind, Refetch, SyncDeps, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub request_id: Uuid,
    pub new: RequestStatus,
    pub old: RequestStatus,
}

pub type StatusCallback = Arc<dyn Fn(StatusChange) + Send + Sync>;

/// Last status seen per request. Refuses anything that would move a request
/// backwards along its lifecycle.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Mutex<HashMap<Uuid, RequestStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_status(&self, request_id: Uuid) -> Option<RequestStatus> {
        self.lock().get(&request_id).copied()
    }

    /// Record a status without judging it, e.g. from an insert.
    pub fn seed(&self, request_id: Uuid, status: RequestStatus) {
        self.lock().entry(request_id).or_insert(status);
    }

    /// Returns whether `old → new` is a fresh forward transition, recording it if so.
    pub fn observe(&self, request_id: Uuid, old: RequestStatus, new: RequestStatus) -> bool {
        let mut last = self.lock();
        let current = last.get(&request_id).copied().unwrap_or(old);

        if current == new {
            return false;
        }
        if current.is_terminal() || new.stage() < current.stage() {
            tracing::warn!(
                "Ignoring out-of-order status for request {}: {} -> {}",
                request_id,
                current,
                new
            );
            return false;
        }

        last.insert(request_id, new);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RequestStatus>> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct RequestStatusOptions {
    pub notices_enabled: bool,
    pub catalog: NoticeCatalog,
    pub on_status_change: Option<StatusCallback>,
}

impl Default for RequestStatusOptions {
    fn default() -> Self {
        Self {
            notices_enabled: true,
            catalog: NoticeCatalog::english(),
            on_status_change: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Provider,
}

struct RequestState {
    deps: SyncDeps,
    options: RequestStatusOptions,
    tracker: StatusTracker,
}

impl RequestState {
    fn refetch(&self, request_id: Option<Uuid>) {
        self.deps.cache.invalidate(CacheKey::Requests, Refetch::Immediate);
        if let Some(id) = request_id {
            self.deps.cache.invalidate(CacheKey::Request(id), Refetch::Immediate);
        }
    }

    fn notify(&self, kind: NoticeKind, text: Option<&NoticeText>, request_id: Uuid) {
        if !self.options.notices_enabled {
            return;
        }
        let Some(text) = text else {
            return;
        };
        let notice = Notice {
            kind,
            title: text.title.clone(),
            description: text.description.clone(),
            request_id,
        };
        if let Err(e) = self.deps.notices.dispatch(notice) {
            tracing::warn!("Failed to show notice for request {}: {}", request_id, e);
        }
    }
}

struct RequestHandler {
    state: Arc<RequestState>,
    role: Role,
}

fn row_status(event: &ChangeEvent) -> Option<RequestStatus> {
    event
        .before
        .as_ref()?
        .get("status")?
        .as_str()?
        .parse()
        .ok()
}

impl ChangeHandler for RequestHandler {
    fn on_insert(&self, event: &ChangeEvent) {
        let state = &self.state;
        let request = match event.new_record::<ListingRequest>() {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                state.refetch(None);
                return;
            }
        };

        state.tracker.seed(request.id, request.status);
        state.refetch(Some(request.id));

        if self.role == Role::Provider {
            state.notify(NoticeKind::NewRequest, Some(state.options.catalog.new_request()), request.id);
        }
    }

    fn on_update(&self, event: &ChangeEvent) {
        let state = &self.state;
        let request = match event.new_record::<ListingRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Undecodable listing request update: {}", e);
                state.refetch(None);
                return;
            }
        };

        let old_status = row_status(event);
        let status_changed = old_status.is_some_and(|old| old != request.status);

        // The re-fetch always happens first, whatever the notice path decides.
        state.refetch(Some(request.id));

        match old_status {
            Some(old) if status_changed => {
                if !state.tracker.observe(request.id, old, request.status) {
                    return;
                }
                state.notify(
                    NoticeKind::StatusChanged(request.status),
                    state.options.catalog.for_status(request.status),
                    request.id,
                );
                if let Some(callback) = &state.options.on_status_change {
                    callback(StatusChange {
                        request_id: request.id,
                        new: request.status,
                        old,
                    });
                }
            }
            _ => {
                let report_changed = match event.old_record::<ListingRequest>() {
                    Ok(Some(previous)) => request.report_changed(&previous),
                    _ => false,
                };
                if report_changed {
                    state.notify(
                        NoticeKind::ReportArrived,
                        Some(state.options.catalog.report_arrived()),
                        request.id,
                    );
                }
            }
        }
    }

    fn on_delete(&self, _event: &ChangeEvent) {
        self.state.refetch(None);
    }
}

/// Status, report and new-request awareness for the current user, on both
/// sides of a request.
pub struct RequestStatusSync {
    state: Arc<RequestState>,
    client: Subscription,
    provider: Subscription,
}

impl RequestStatusSync {
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        deps: &SyncDeps,
        options: RequestStatusOptions,
        retry: RetryConfig,
    ) -> Result<Self, SyncError> {
        let me = deps.require_user()?;
        let state = Arc::new(RequestState {
            deps: deps.clone(),
            options,
            tracker: StatusTracker::new(),
        });

        let open = |role: Role, column: &str| {
            let name = match role {
                Role::Client => format!("requests:client:{}", me),
                Role::Provider => format!("requests:provider:{}", me),
            };
            let channel = ChannelSpec::table(name, tables::LISTING_REQUESTS)
                .with_filter(RowFilter::equals(column, me));
            let handler = Arc::new(RequestHandler {
                state: state.clone(),
                role,
            });
            Subscription::create(feed.clone(), SubscriptionConfig::new(channel, handler), retry)
        };

        let client = open(Role::Client, "client_id");
        let provider = open(Role::Provider, "provider_id");

        Ok(Self {
            state,
            client,
            provider,
        })
    }

    pub fn last_status(&self, request_id: Uuid) -> Option<RequestStatus> {
        self.state.tracker.last_status(request_id)
    }

    pub fn client_state(&self) -> SubscriptionState {
        self.client.state()
    }

    pub fn provider_state(&self) -> SubscriptionState {
        self.provider.state()
    }

    pub fn stop(&self) {
        self.client.unsubscribe();
        self.provider.unsubscribe();
    }
}
