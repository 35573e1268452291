//! Wire shapes sent to the collector
//!
//! ## Envelope
//!
//! Every payload carries the fields the collector de-duplicates and joins
//! on: `eventId` (track events), `anonymousId`, `sessionId`, `timestamp`
//! (epoch milliseconds) and `path`. Custom properties are flattened into the
//! track event object; a property named like an envelope field is dropped.
//!
//! Track events also carry the page's campaign parameters (`utm_*`) and the
//! host's language and time zone when known.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

/// Property keys that belong to the envelope
pub const RESERVED_KEYS: &[&str] = &[
    "eventId",
    "name",
    "anonymousId",
    "sessionId",
    "sessionStartTime",
    "timestamp",
    "path",
    "title",
    "referrer",
    "language",
    "timezone",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Value of `eventType` on events sent through `track_custom_event`
pub const CUSTOM_EVENT_TYPE: &str = "custom";

/// Collector endpoint family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Events,
    Errors,
    Vitals,
    /// Lean custom-event spans
    Custom,
}

impl Channel {
    /// Path for a single-object payload
    pub fn single_path(&self) -> &'static str {
        match self {
            Channel::Events => "/",
            Channel::Errors => "/errors",
            Channel::Vitals => "/vitals",
            Channel::Custom => "/events",
        }
    }

    /// Path for a JSON-array payload
    pub fn batch_path(&self) -> &'static str {
        match self {
            Channel::Events => "/batch",
            Channel::Errors => "/errors",
            Channel::Vitals => "/vitals",
            Channel::Custom => "/events",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Events => "events",
            Channel::Errors => "errors",
            Channel::Vitals => "vitals",
            Channel::Custom => "custom",
        })
    }
}

/// Campaign parameters read from the page query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
}

impl UtmParams {
    /// Non-empty `utm_*` parameters of `url`
    pub fn from_url(url: &Url) -> Self {
        let mut utm = Self::default();
        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "utm_source" => &mut utm.utm_source,
                "utm_medium" => &mut utm.utm_medium,
                "utm_campaign" => &mut utm.utm_campaign,
                "utm_term" => &mut utm.utm_term,
                "utm_content" => &mut utm.utm_content,
                _ => continue,
            };
            // First occurrence wins.
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        utm
    }
}

/// Identity and page context stamped on every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub anonymous_id: String,
    pub session_id: String,
    pub session_start_time: i64,
    pub timestamp: i64,
    pub path: String,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub language: Option<String>,
    pub timezone: Option<String>,
    pub utm: UtmParams,
}

/// A tracked event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub name: String,
    pub anonymous_id: String,
    pub session_id: String,
    pub session_start_time: i64,
    pub timestamp: i64,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub utm: UtmParams,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Event {
    /// Build an event from context, global properties and call properties.
    ///
    /// Call properties override globals; envelope keys are stripped.
    pub fn new(
        name: impl Into<String>,
        context: EventContext,
        globals: &Map<String, Value>,
        properties: Map<String, Value>,
    ) -> Self {
        let mut merged = globals.clone();
        merged.extend(properties);
        merged.retain(|key, _| {
            let reserved = RESERVED_KEYS.contains(&key.as_str());
            if reserved {
                tracing::debug!(key = %key, "dropping property that shadows an envelope field");
            }
            !reserved
        });

        Self {
            event_id: Uuid::new_v4().to_string(),
            name: name.into(),
            anonymous_id: context.anonymous_id,
            session_id: context.session_id,
            session_start_time: context.session_start_time,
            timestamp: context.timestamp,
            path: context.path,
            title: context.title,
            referrer: context.referrer,
            language: context.language,
            timezone: context.timezone,
            utm: context.utm,
            properties: merged,
        }
    }
}

/// Host-supplied predicate deciding whether a built event is sent
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(&Event) -> bool + Send + Sync>);

impl EventFilter {
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(filter))
    }

    pub fn allows(&self, event: &Event) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

impl PartialEq for EventFilter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Payload for the `/events` endpoint: name plus free-form properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEventSpan {
    pub timestamp: i64,
    pub path: String,
    pub event_name: String,
    pub properties: Map<String, Value>,
    pub anonymous_id: String,
    pub session_id: String,
}

impl CustomEventSpan {
    pub fn new(
        name: impl Into<String>,
        properties: Map<String, Value>,
        context: &EventContext,
    ) -> Self {
        Self {
            timestamp: context.timestamp,
            path: context.path.clone(),
            event_name: name.into(),
            properties,
            anonymous_id: context.anonymous_id.clone(),
            session_id: context.session_id.clone(),
        }
    }
}

/// An error as reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub stack: Option<String>,
    pub error_type: Option<String>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Error payload for the `/errors` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSpan {
    pub timestamp: i64,
    pub path: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub error_type: String,
    pub anonymous_id: String,
    pub session_id: String,
}

impl ErrorSpan {
    pub fn new(report: ErrorReport, context: &EventContext) -> Self {
        Self {
            timestamp: context.timestamp,
            path: context.path.clone(),
            message: report.message,
            filename: report.filename,
            lineno: report.lineno,
            colno: report.colno,
            stack: report.stack,
            error_type: report.error_type.unwrap_or_else(|| "Error".to_string()),
            anonymous_id: context.anonymous_id.clone(),
            session_id: context.session_id.clone(),
        }
    }
}

/// Web-vitals metric names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricName {
    Fcp,
    Lcp,
    Cls,
    Inp,
    Ttfb,
    Fps,
}

impl MetricName {
    pub const ALL: [MetricName; 6] = [
        MetricName::Fcp,
        MetricName::Lcp,
        MetricName::Cls,
        MetricName::Inp,
        MetricName::Ttfb,
        MetricName::Fps,
    ];

    /// Metrics whose first report is already their final value
    pub fn is_final_on_first_report(&self) -> bool {
        matches!(self, MetricName::Fcp | MetricName::Ttfb | MetricName::Fps)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Fcp => "FCP",
            MetricName::Lcp => "LCP",
            MetricName::Cls => "CLS",
            MetricName::Inp => "INP",
            MetricName::Ttfb => "TTFB",
            MetricName::Fps => "FPS",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement of one metric for one page view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSample {
    pub timestamp: i64,
    pub path: String,
    pub metric_name: MetricName,
    pub metric_value: f64,
    pub anonymous_id: String,
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> EventContext {
        EventContext {
            anonymous_id: "anon_1".to_string(),
            session_id: "sess_1".to_string(),
            session_start_time: 100,
            timestamp: 200,
            path: "https://example.com/pricing".to_string(),
            title: Some("Pricing".to_string()),
            referrer: None,
            language: Some("en-US".to_string()),
            timezone: None,
            utm: UtmParams::default(),
        }
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_event_serializes_flat_camel_case() {
        let event = Event::new(
            "signup",
            context(),
            &Map::new(),
            map(json!({"plan": "pro", "seats": 3})),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["name"], "signup");
        assert_eq!(value["anonymousId"], "anon_1");
        assert_eq!(value["sessionId"], "sess_1");
        assert_eq!(value["timestamp"], 200);
        assert_eq!(value["path"], "https://example.com/pricing");
        assert_eq!(value["plan"], "pro");
        assert_eq!(value["seats"], 3);
        assert!(value.get("referrer").is_none());
        assert!(value["eventId"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn test_properties_override_globals_and_cannot_shadow_envelope() {
        let globals = map(json!({"env": "prod", "plan": "free"}));
        let event = Event::new(
            "upgrade",
            context(),
            &globals,
            map(json!({"plan": "pro", "sessionId": "forged", "name": "forged"})),
        );

        assert_eq!(event.properties["env"], "prod");
        assert_eq!(event.properties["plan"], "pro");
        assert_eq!(event.session_id, "sess_1");
        assert_eq!(event.name, "upgrade");
        assert!(!event.properties.contains_key("sessionId"));
    }

    #[test]
    fn test_event_ids_unique() {
        let a = Event::new("a", context(), &Map::new(), Map::new());
        let b = Event::new("a", context(), &Map::new(), Map::new());
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_error_span_defaults_type() {
        let span = ErrorSpan::new(ErrorReport::new("boom"), &context());
        assert_eq!(span.error_type, "Error");
        let value = serde_json::to_value(&span).unwrap();
        assert_eq!(value["message"], "boom");
        assert_eq!(value["errorType"], "Error");
        assert!(value.get("stack").is_none());
    }

    #[test]
    fn test_vital_sample_metric_names() {
        let sample = VitalSample {
            timestamp: 1,
            path: "/".to_string(),
            metric_name: MetricName::Ttfb,
            metric_value: 12.5,
            anonymous_id: "anon_1".to_string(),
            session_id: "sess_1".to_string(),
        };
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["metricName"], "TTFB");
        assert_eq!(value["metricValue"], 12.5);
        assert_eq!(MetricName::Cls.to_string(), "CLS");
    }

    #[test]
    fn test_channel_paths() {
        assert_eq!(Channel::Events.single_path(), "/");
        assert_eq!(Channel::Events.batch_path(), "/batch");
        assert_eq!(Channel::Vitals.batch_path(), "/vitals");
        assert_eq!(Channel::Errors.single_path(), "/errors");
        assert_eq!(Channel::Custom.single_path(), "/events");
        assert_eq!(Channel::Custom.batch_path(), "/events");
    }

    #[test]
    fn test_utm_params_from_query() {
        let url = Url::parse(
            "https://example.com/?utm_source=news&utm_medium=&utm_campaign=fall&utm_source=other&x=1",
        )
        .unwrap();
        let utm = UtmParams::from_url(&url);
        assert_eq!(utm.utm_source.as_deref(), Some("news"));
        assert_eq!(utm.utm_medium, None);
        assert_eq!(utm.utm_campaign.as_deref(), Some("fall"));
        assert_eq!(utm.utm_term, None);
    }

    #[test]
    fn test_event_carries_utm_and_locale() {
        let mut ctx = context();
        ctx.utm.utm_source = Some("news".to_string());
        let event = Event::new(
            "signup",
            ctx,
            &Map::new(),
            map(json!({"utm_source": "spoofed", "language": "xx"})),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["utm_source"], "news");
        assert_eq!(value["language"], "en-US");
        assert!(value.get("timezone").is_none());
        assert!(value.get("utm_medium").is_none());
    }

    #[test]
    fn test_custom_event_span_shape() {
        let mut props = Map::new();
        props.insert("plan".to_string(), json!("pro"));
        let span = CustomEventSpan::new("upgrade", props, &context());
        let value = serde_json::to_value(&span).unwrap();
        assert_eq!(value["eventName"], "upgrade");
        assert_eq!(value["properties"]["plan"], "pro");
        assert_eq!(value["anonymousId"], span.anonymous_id.as_str());
        assert_eq!(value["path"], span.path.as_str());
    }

    #[test]
    fn test_event_filter_identity() {
        let filter = EventFilter::new(|event| event.name != "noise");
        let event = Event::new("noise", context(), &Map::new(), Map::new());
        assert!(!filter.allows(&event));
        assert_eq!(filter, filter.clone());
        assert_ne!(filter, EventFilter::new(|_| true));
    }
}
