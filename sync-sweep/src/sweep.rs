use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use sync_core::config::SweepConfig;
use sync_core::types::notification_types;
use sync_core::{Clock, RequestAction, RequestStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{ExpiryBatch, ExpiryCandidate, ExpiryOutcome, NewNotification, RequestStore, StoreError};

pub const PENDING_EXPIRED_RESPONSE: &str =
    "Automatically cancelled: the provider did not respond to this request in time.";
pub const ACCEPTED_EXPIRED_RESPONSE: &str =
    "Automatically cancelled: the scheduled time passed without the service being started.";

const EXPIRED_TITLE: &str = "Request expired";
const PENDING_CLIENT_MESSAGE: &str = "Your request expired because the provider did not respond in time.";
const ACCEPTED_CLIENT_MESSAGE: &str =
    "Your request was cancelled because its scheduled time passed without the service being started.";
const ACCEPTED_PROVIDER_MESSAGE: &str =
    "A request you accepted was cancelled because its scheduled time passed without the service being started.";

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep aborted: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_pending: usize,
    pub expired_accepted: usize,
    pub notifications_created: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn expired(&self) -> usize {
        self.expired_pending + self.expired_accepted
    }
}

/// Expires stale requests. Runs are serialized, so a run always sees the
/// writes of the one before it.
pub struct Sweeper {
    store: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    lock: Mutex<()>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn RequestStore>, clock: Arc<dyn Clock>, config: SweepConfig) -> Self {
        Self {
            store,
            clock,
            config,
            lock: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let mut report = SweepReport::default();

        self.expire_pending(now, &mut report).await?;
        self.expire_accepted(now, &mut report).await?;

        if report.expired() > 0 || !report.errors.is_empty() {
            tracing::info!(
                "Sweep expired {} pending and {} accepted requests, {} notifications, {} errors",
                report.expired_pending,
                report.expired_accepted,
                report.notifications_created,
                report.errors.len()
            );
        } else {
            tracing::debug!("Sweep found nothing to expire");
        }

        Ok(report)
    }

    async fn expire_pending(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), SweepError> {
        let cutoff = now - Duration::hours(self.config.pending_ttl_hours);
        let candidates = match self.store.pending_created_before(cutoff).await {
            Ok(candidates) => candidates,
            Err(e) => return record_failure(report, "pending", e),
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let outcome = self
            .apply_expiry("pending", candidates.iter().collect(), PENDING_EXPIRED_RESPONSE, now, report, |c| {
                vec![expiry_notice(c.client_id, c.id, PENDING_CLIENT_MESSAGE, now)]
            })
            .await?;
        report.expired_pending += outcome.updated;
        Ok(())
    }

    async fn expire_accepted(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), SweepError> {
        let candidates = match self.store.accepted_with_preferred_date().await {
            Ok(candidates) => candidates,
            Err(e) => return record_failure(report, "accepted", e),
        };

        let mut expired: Vec<&ExpiryCandidate> = Vec::new();
        for candidate in &candidates {
            match self.deadline(candidate) {
                Ok(Some(deadline)) if now > deadline => expired.push(candidate),
                Ok(_) => {}
                Err(message) => {
                    tracing::warn!("{}", message);
                    report.errors.push(message);
                }
            }
        }
        if expired.is_empty() {
            return Ok(());
        }

        let outcome = self
            .apply_expiry("accepted", expired, ACCEPTED_EXPIRED_RESPONSE, now, report, |c| {
                vec![
                    expiry_notice(c.client_id, c.id, ACCEPTED_CLIENT_MESSAGE, now),
                    expiry_notice(c.provider_id, c.id, ACCEPTED_PROVIDER_MESSAGE, now),
                ]
            })
            .await?;
        report.expired_accepted += outcome.updated;
        Ok(())
    }

    /// Writes one batch per expiry target. Candidates the lifecycle no longer
    /// lets expire are left untouched.
    async fn apply_expiry(
        &self,
        rule: &str,
        candidates: Vec<&ExpiryCandidate>,
        provider_response: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
        notices: impl Fn(&ExpiryCandidate) -> Vec<NewNotification>,
    ) -> Result<ExpiryOutcome, SweepError> {
        let mut total = ExpiryOutcome::default();

        for (status, group) in expiry_targets(rule, candidates, report) {
            let batch = ExpiryBatch {
                ids: group.iter().map(|c| c.id).collect(),
                status,
                provider_response: provider_response.to_string(),
                at: now,
                notifications: group.iter().flat_map(|c| notices(c)).collect(),
            };

            match self.store.expire(batch).await {
                Ok(outcome) => {
                    total.updated += outcome.updated;
                    total.notifications += outcome.notifications;
                }
                Err(e) => record_failure(report, rule, e)?,
            }
        }

        report.notifications_created += total.notifications;
        Ok(total)
    }

    /// `preferred_date` at `preferred_time` (or the default time) in the
    /// configured offset, plus the grace period.
    fn deadline(&self, candidate: &ExpiryCandidate) -> Result<Option<DateTime<Utc>>, String> {
        let Some(date) = candidate.preferred_date else {
            return Ok(None);
        };
        let time = match candidate.preferred_time.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => parse_time(raw).ok_or_else(|| {
                format!("request {}: invalid preferred_time {:?}", candidate.id, raw)
            })?,
            _ => self.default_time(),
        };

        let start = combine(date, time, self.offset()).ok_or_else(|| {
            format!("request {}: {} {} does not exist in the configured offset", candidate.id, date, time)
        })?;
        Ok(Some(start + Duration::hours(self.config.accepted_grace_hours)))
    }

    fn default_time(&self) -> NaiveTime {
        parse_time(&self.config.default_preferred_time)
            .or_else(|| NaiveTime::from_hms_opt(9, 0, 0))
            .unwrap_or(NaiveTime::MIN)
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.config.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn record_failure(report: &mut SweepReport, rule: &str, e: StoreError) -> Result<(), SweepError> {
    match e {
        StoreError::Unavailable(message) => {
            tracing::error!("Sweep aborted, store unavailable: {}", message);
            Err(SweepError::Unavailable(message))
        }
        StoreError::Query(message) => {
            tracing::error!("Sweep rule {} failed: {}", rule, message);
            report.errors.push(format!("{}: {}", rule, message));
            Ok(())
        }
    }
}

fn expiry_targets<'a>(
    rule: &str,
    candidates: Vec<&'a ExpiryCandidate>,
    report: &mut SweepReport,
) -> Vec<(RequestStatus, Vec<&'a ExpiryCandidate>)> {
    let mut groups: Vec<(RequestStatus, Vec<&'a ExpiryCandidate>)> = Vec::new();

    for candidate in candidates {
        let current = match candidate.status.parse::<RequestStatus>() {
            Ok(status) => status,
            Err(e) => {
                let message = format!("{}: request {}: {}", rule, candidate.id, e);
                tracing::warn!("{}", message);
                report.errors.push(message);
                continue;
            }
        };

        match current.apply(RequestAction::Expire) {
            Ok(target) => match groups.iter_mut().find(|(status, _)| *status == target) {
                Some((_, group)) => group.push(candidate),
                None => groups.push((target, vec![candidate])),
            },
            Err(e) => {
                tracing::info!("Not expiring request {}: {}", candidate.id, e);
            }
        }
    }

    groups
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn combine(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|local| local.with_timezone(&Utc))
}

fn expiry_notice(user_id: Uuid, request_id: Uuid, message: &str, now: DateTime<Utc>) -> NewNotification {
    NewNotification {
        id: Uuid::new_v4(),
        user_id,
        notification_type: notification_types::REQUEST_EXPIRED.to_string(),
        title: EXPIRED_TITLE.to_string(),
        message: message.to_string(),
        request_id: Some(request_id),
        actor_id: None,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRequestStore;
    use sync_core::{ListingRequest, ManualClock};

    fn t(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn request(status: RequestStatus, created_at: DateTime<Utc>) -> ListingRequest {
        ListingRequest {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            status,
            created_at,
            preferred_date: None,
            preferred_time: None,
            provider_response: None,
            completion_description: None,
            completion_photos: None,
        }
    }

    fn accepted_on(day: u32, time: Option<&str>) -> ListingRequest {
        ListingRequest {
            preferred_date: NaiveDate::from_ymd_opt(2026, 3, day),
            preferred_time: time.map(str::to_string),
            ..request(RequestStatus::Accepted, t(1, 8, 0))
        }
    }

    fn sweeper(store: &Arc<MemoryRequestStore>, now: DateTime<Utc>) -> (Sweeper, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (
            Sweeper::new(store.clone(), clock.clone(), SweepConfig::default()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_pending_request_expires_after_ttl() {
        let r = request(RequestStatus::Pending, t(1, 10, 0));
        let fresh = request(RequestStatus::Pending, t(2, 10, 0));
        let store = Arc::new(MemoryRequestStore::new(vec![r.clone(), fresh.clone()]));
        let (sweeper, _) = sweeper(&store, t(2, 11, 0));

        let report = sweeper.run().await.unwrap();

        assert_eq!(report.expired_pending, 1);
        assert_eq!(report.notifications_created, 1);
        let expired = store.request(r.id).unwrap();
        assert_eq!(expired.status, RequestStatus::CancelledByProvider);
        assert_eq!(expired.provider_response.as_deref(), Some(PENDING_EXPIRED_RESPONSE));
        assert_eq!(store.request(fresh.id).unwrap().status, RequestStatus::Pending);

        let notifications = store.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].user_id, r.client_id);
        assert_eq!(notifications[0].request_id, Some(r.id));
        assert_eq!(notifications[0].notification_type, "request_expired");
    }

    #[tokio::test]
    async fn test_accepted_request_expires_two_hours_after_slot() {
        let r = accepted_on(4, Some("14:00"));
        let store = Arc::new(MemoryRequestStore::new(vec![r.clone()]));
        let (sweeper, clock) = sweeper(&store, t(4, 15, 59));

        let report = sweeper.run().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(store.request(r.id).unwrap().status, RequestStatus::Accepted);

        clock.set(t(4, 16, 1));
        let report = sweeper.run().await.unwrap();
        assert_eq!(report.expired_accepted, 1);
        assert_eq!(report.notifications_created, 2);

        let recipients: Vec<Uuid> = store.notifications().iter().map(|n| n.user_id).collect();
        assert_eq!(recipients, vec![r.client_id, r.provider_id]);
        assert_eq!(
            store.request(r.id).unwrap().provider_response.as_deref(),
            Some(ACCEPTED_EXPIRED_RESPONSE)
        );
    }

    #[tokio::test]
    async fn test_missing_time_uses_nine_am_and_offset_applies() {
        let r = accepted_on(4, None);
        let store = Arc::new(MemoryRequestStore::new(vec![r.clone()]));
        let clock = Arc::new(ManualClock::new(t(4, 11, 30)));
        let config = SweepConfig {
            utc_offset_minutes: -180,
            ..SweepConfig::default()
        };
        let sweeper = Sweeper::new(store.clone(), clock.clone(), config);

        // 09:00 at UTC-3 is 12:00 UTC, so the deadline is 14:00 UTC.
        assert_eq!(sweeper.run().await.unwrap().expired_accepted, 0);
        clock.set(t(4, 14, 1));
        assert_eq!(sweeper.run().await.unwrap().expired_accepted, 1);
    }

    #[tokio::test]
    async fn test_second_run_finds_nothing() {
        let store = Arc::new(MemoryRequestStore::new(vec![
            request(RequestStatus::Pending, t(1, 0, 0)),
            accepted_on(1, Some("08:00:00")),
        ]));
        let (sweeper, _) = sweeper(&store, t(3, 0, 0));

        let first = sweeper.run().await.unwrap();
        assert_eq!(first.expired(), 2);
        assert_eq!(first.notifications_created, 3);

        let second = sweeper.run().await.unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(store.notifications().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_double_expire() {
        let store = Arc::new(MemoryRequestStore::new(vec![request(RequestStatus::Pending, t(1, 0, 0))]));
        let (sweeper, _) = sweeper(&store, t(3, 0, 0));
        let sweeper = Arc::new(sweeper);

        let (a, b) = tokio::join!(sweeper.run(), sweeper.run());
        assert_eq!(a.unwrap().expired_pending + b.unwrap().expired_pending, 1);
        assert_eq!(store.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_time_is_reported_without_blocking_others() {
        let broken = accepted_on(1, Some("2pm"));
        let valid = accepted_on(1, Some("10:00"));
        let store = Arc::new(MemoryRequestStore::new(vec![broken.clone(), valid.clone()]));
        let (sweeper, _) = sweeper(&store, t(2, 0, 0));

        let report = sweeper.run().await.unwrap();
        assert_eq!(report.expired_accepted, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(&broken.id.to_string()));
        assert_eq!(store.request(broken.id).unwrap().status, RequestStatus::Accepted);
        assert_eq!(store.request(valid.id).unwrap().status, RequestStatus::CancelledByProvider);
    }

    #[tokio::test]
    async fn test_query_failure_is_collected_and_unavailable_aborts() {
        let pending = request(RequestStatus::Pending, t(1, 0, 0));
        let store = Arc::new(MemoryRequestStore::new(vec![pending.clone(), accepted_on(1, None)]));
        let (sweeper, _) = sweeper(&store, t(3, 0, 0));

        store.fail_accepted_query(true);
        let report = sweeper.run().await.unwrap();
        assert_eq!(report.expired_pending, 1);
        assert_eq!(report.expired_accepted, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("accepted:"));

        store.set_unavailable(true);
        assert!(matches!(sweeper.run().await, Err(SweepError::Unavailable(_))));
    }

    /// Serves a fixed candidate list, as a read that raced a user action would.
    struct SnapshotStore {
        pending: Vec<ExpiryCandidate>,
        batches: std::sync::Mutex<Vec<ExpiryBatch>>,
    }

    #[async_trait::async_trait]
    impl RequestStore for SnapshotStore {
        async fn pending_created_before(&self, _cutoff: DateTime<Utc>) -> Result<Vec<ExpiryCandidate>, StoreError> {
            Ok(self.pending.clone())
        }

        async fn accepted_with_preferred_date(&self) -> Result<Vec<ExpiryCandidate>, StoreError> {
            Ok(Vec::new())
        }

        async fn expire(&self, batch: ExpiryBatch) -> Result<ExpiryOutcome, StoreError> {
            let outcome = ExpiryOutcome {
                updated: batch.ids.len(),
                notifications: batch.notifications.len(),
            };
            self.batches.lock().unwrap().push(batch);
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn test_terminal_candidate_is_not_rewritten() {
        let completed = ExpiryCandidate::from(&request(RequestStatus::Completed, t(1, 0, 0)));
        let pending = ExpiryCandidate::from(&request(RequestStatus::Pending, t(1, 0, 0)));
        let mut unknown = ExpiryCandidate::from(&request(RequestStatus::Pending, t(1, 0, 0)));
        unknown.status = "archived".to_string();

        let store = Arc::new(SnapshotStore {
            pending: vec![completed.clone(), pending.clone(), unknown.clone()],
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let sweeper = Sweeper::new(
            store.clone(),
            Arc::new(ManualClock::new(t(3, 0, 0))),
            SweepConfig::default(),
        );

        let report = sweeper.run().await.unwrap();
        assert_eq!(report.expired_pending, 1);
        assert_eq!(report.notifications_created, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(&unknown.id.to_string()));

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ids, vec![pending.id]);
        assert_eq!(batches[0].status, RequestStatus::CancelledByProvider);
        assert_eq!(batches[0].notifications[0].user_id, pending.client_id);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = SweepReport {
            expired_pending: 2,
            expired_accepted: 1,
            notifications_created: 4,
            errors: vec![],
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "expiredPending": 2,
                "expiredAccepted": 1,
                "notificationsCreated": 4,
                "errors": []
            })
        );
    }
}
