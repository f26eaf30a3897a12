use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::RequestStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRequest {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub listing_id: Uuid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub preferred_date: Option<NaiveDate>,
    #[serde(default)]
    pub preferred_time: Option<String>,
    #[serde(default)]
    pub provider_response: Option<String>,
    #[serde(default)]
    pub completion_description: Option<String>,
    #[serde(default)]
    pub completion_photos: Option<Vec<String>>,
}

impl ListingRequest {
    /// Whether the completion report fields differ between two versions of a row.
    pub fn report_changed(&self, previous: &ListingRequest) -> bool {
        self.completion_description != previous.completion_description
            || self.completion_photos != previous.completion_photos
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub request_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub user_id: Uuid,
    pub request_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

/// The slice of a listing row the view counter cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingViews {
    pub id: Uuid,
    #[serde(default)]
    pub view_count: i64,
}

/// Notification types written by the system.
pub mod notification_types {
    pub const REQUEST_EXPIRED: &str = "request_expired";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_request_from_feed_row() {
        let row = serde_json::json!({
            "id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e111",
            "client_id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e112",
            "provider_id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e113",
            "listing_id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e114",
            "status": "awaiting_client_confirmation",
            "created_at": "2026-03-01T10:00:00Z",
            "preferred_date": "2026-03-04",
            "preferred_time": "14:00",
            "provider_response": null,
            "extra_column": 42
        });

        let request: ListingRequest = serde_json::from_value(row).unwrap();
        assert_eq!(request.status, RequestStatus::AwaitingClientConfirmation);
        assert_eq!(request.preferred_date, NaiveDate::from_ymd_opt(2026, 3, 4));
        assert_eq!(request.completion_photos, None);
    }

    #[test]
    fn test_notification_type_field_name() {
        let row = serde_json::json!({
            "id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e121",
            "user_id": "5b1a0a34-7a44-4d7e-9d0c-6f0d3af0e122",
            "type": "request_expired",
            "title": "Request expired",
            "message": "…",
            "created_at": "2026-03-01T10:00:00Z"
        });
        let notification: Notification = serde_json::from_value(row).unwrap();
        assert_eq!(notification.notification_type, notification_types::REQUEST_EXPIRED);
        assert!(notification.is_unread());
    }
}
