use chrono::{DateTime, Utc};
use serde::Serialize;

/// The three outbound event kinds a bucket cache (or the global cache's
/// polling-reset logic) can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutEventKind {
    ObjectCreated,
    ObjectRemoved,
    Reset,
}

/// A single outbound event, serialized to JSON exactly in the shape
/// downstream consumers (the WebSocket fan-out, in the original deployment)
/// expect. `object_type` carries the configured selector name the event
/// pertains to (`"preview"`, `"target"`, or a dynamic-input selector name).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutEvent {
    pub event_type: OutEventKind,
    pub object_type: String,
    pub image_bucket: String,
    pub image_key: String,
    pub object_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OutEvent {
    pub fn reset(bucket: impl Into<String>) -> Self {
        Self {
            event_type: OutEventKind::Reset,
            object_type: String::new(),
            image_bucket: bucket.into(),
            image_key: String::new(),
            object_time: Utc::now(),
            object: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_omits_absent_optional_fields() {
        let event = OutEvent {
            event_type: OutEventKind::ObjectCreated,
            object_type: "preview".to_string(),
            image_bucket: "b".to_string(),
            image_key: "p/1/2/preview.jpg".to_string(),
            object_time: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into(),
            object: None,
            error: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("object").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["eventType"], "ObjectCreated");
        assert_eq!(json["objectType"], "preview");
    }
}
