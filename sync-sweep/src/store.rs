use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use sync_core::schema::{listing_requests, notifications};
use sync_core::{DbPool, ListingRequest, RequestStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No connection could be obtained. Aborts the whole sweep.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

/// The columns of a request the sweep rules look at.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = listing_requests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ExpiryCandidate {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider_id: Uuid,
    /// Status as read. The sweep re-checks it against the lifecycle.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time: Option<String>,
}

impl From<&ListingRequest> for ExpiryCandidate {
    fn from(r: &ListingRequest) -> Self {
        Self {
            id: r.id,
            client_id: r.client_id,
            provider_id: r.provider_id,
            status: r.status.as_str().to_string(),
            created_at: r.created_at,
            preferred_date: r.preferred_date,
            preferred_time: r.preferred_time.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub request_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One rule's writes, applied atomically.
#[derive(Debug, Clone)]
pub struct ExpiryBatch {
    pub ids: Vec<Uuid>,
    pub status: RequestStatus,
    pub provider_response: String,
    pub at: DateTime<Utc>,
    pub notifications: Vec<NewNotification>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryOutcome {
    pub updated: usize,
    pub notifications: usize,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExpiryCandidate>, StoreError>;

    async fn accepted_with_preferred_date(&self) -> Result<Vec<ExpiryCandidate>, StoreError>;

    /// Bulk status update keyed by `batch.ids` plus the notification insert,
    /// in one transaction.
    async fn expire(&self, batch: ExpiryBatch) -> Result<ExpiryOutcome, StoreError>;
}

pub struct PgRequestStore {
    pool: Arc<DbPool>,
}

impl PgRequestStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<sync_core::db::DbConnection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExpiryCandidate>, StoreError> {
        let mut conn = self.connection().await?;
        let rows = listing_requests::table
            .filter(listing_requests::status.eq(RequestStatus::Pending.as_str()))
            .filter(listing_requests::created_at.lt(cutoff))
            .select(ExpiryCandidate::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn accepted_with_preferred_date(&self) -> Result<Vec<ExpiryCandidate>, StoreError> {
        let mut conn = self.connection().await?;
        let rows = listing_requests::table
            .filter(listing_requests::status.eq(RequestStatus::Accepted.as_str()))
            .filter(listing_requests::preferred_date.is_not_null())
            .select(ExpiryCandidate::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn expire(&self, batch: ExpiryBatch) -> Result<ExpiryOutcome, StoreError> {
        if batch.ids.is_empty() {
            return Ok(ExpiryOutcome::default());
        }

        let mut conn = self.connection().await?;
        let outcome = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let updated = diesel::update(
                        listing_requests::table.filter(listing_requests::id.eq_any(&batch.ids)),
                    )
                    .set((
                        listing_requests::status.eq(batch.status.as_str()),
                        listing_requests::provider_response.eq(Some(batch.provider_response.as_str())),
                        listing_requests::updated_at.eq(batch.at),
                    ))
                    .execute(conn)
                    .await?;

                    let notifications = diesel::insert_into(notifications::table)
                        .values(&batch.notifications)
                        .execute(conn)
                        .await?;

                    Ok(ExpiryOutcome {
                        updated,
                        notifications,
                    })
                }
                .scope_boxed()
            })
            .await?;

        Ok(outcome)
    }
}
