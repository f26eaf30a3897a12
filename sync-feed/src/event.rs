use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as delivered by the feed: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// One physical row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    pub table: String,
    #[serde(rename = "old", default)]
    pub before: Option<Row>,
    #[serde(rename = "new", default)]
    pub after: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            event_type: EventType::Insert,
            table: table.into(),
            before: None,
            after: Some(row),
        }
    }

    pub fn update(table: impl Into<String>, before: Row, after: Row) -> Self {
        Self {
            event_type: EventType::Update,
            table: table.into(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(table: impl Into<String>, before: Row) -> Self {
        Self {
            event_type: EventType::Delete,
            table: table.into(),
            before: Some(before),
            after: None,
        }
    }

    /// The row a filter is evaluated against: the new row, or the old one for deletes.
    pub fn subject(&self) -> Option<&Row> {
        match self.event_type {
            EventType::Delete => self.before.as_ref(),
            EventType::Insert | EventType::Update => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    pub fn new_record<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        decode_row(self.after.as_ref())
    }

    pub fn old_record<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        decode_row(self.before.as_ref())
    }
}

fn decode_row<T: DeserializeOwned>(row: Option<&Row>) -> Result<Option<T>, serde_json::Error> {
    row.map(|r| serde_json::from_value(Value::Object(r.clone())))
        .transpose()
}

/// Set of event types a channel wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypes {
    insert: bool,
    update: bool,
    delete: bool,
}

impl EventTypes {
    pub const ALL: EventTypes = EventTypes {
        insert: true,
        update: true,
        delete: true,
    };

    pub fn only(types: &[EventType]) -> Self {
        let mut set = EventTypes {
            insert: false,
            update: false,
            delete: false,
        };
        for t in types {
            match t {
                EventType::Insert => set.insert = true,
                EventType::Update => set.update = true,
                EventType::Delete => set.delete = true,
            }
        }
        set
    }

    pub fn contains(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Insert => self.insert,
            EventType::Update => self.update,
            EventType::Delete => self.delete,
        }
    }
}

impl Default for EventTypes {
    fn default() -> Self {
        EventTypes::ALL
    }
}
