use chrono::{DateTime, Utc};

/// The kind of S3 notification (or polling-derived) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Remove,
}

/// Classification of the object an event refers to.
///
/// Left as `NotYetAssigned` by the polling source; the notification source
/// fills this in directly from the subscription it came from. The classifier
/// resolves `NotYetAssigned` events against the image type's configured file
/// selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectType {
    Preview,
    Target,
    DynamicInput(String),
    NotYetAssigned,
}

/// A raw object event as produced by an [`crate::ObjectSource`].
#[derive(Debug, Clone)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub bucket: String,
    pub event_type: EventType,
    pub object_type: Option<ObjectType>,
    pub size: i64,
    pub object_key: String,
    pub object_last_modified: DateTime<Utc>,
}
