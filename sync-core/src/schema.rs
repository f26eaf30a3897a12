use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    listing_requests (id) {
        id -> Uuid,
        client_id -> Uuid,
        provider_id -> Uuid,
        listing_id -> Uuid,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        preferred_date -> Nullable<Date>,
        preferred_time -> Nullable<Text>,
        provider_response -> Nullable<Text>,
        completion_description -> Nullable<Text>,
        completion_photos -> Nullable<Array<Text>>,
    }
}

table! {
    notifications (id) {
        id -> Uuid,
        user_id -> Uuid,
        #[sql_name = "type"]
        notification_type -> Text,
        title -> Text,
        message -> Text,
        request_id -> Nullable<Uuid>,
        actor_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        read_at -> Nullable<Timestamptz>,
    }
}

allow_tables_to_appear_in_same_query!(listing_requests, notifications);

/// Change-feed table names, matching the store-of-record tables.
pub mod tables {
    pub const LISTING_REQUESTS: &str = "listing_requests";
    pub const CHAT_MESSAGES: &str = "chat_messages";
    pub const LIVE_LOCATIONS: &str = "live_locations";
    pub const LISTINGS: &str = "listings";
    pub const NOTIFICATIONS: &str = "notifications";
}
