//! Span model for workflow tracing
//!
//! Spans describe one unit of executed work (a run, a node dispatch, a
//! child workflow) with timing, status, typed attributes and events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A 16-byte trace identifier, hex-encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    /// Generate a new random trace id
    ///
    /// An all-zero trace id is invalid per the W3C trace-context spec,
    /// so generation retries until at least one byte is non-zero.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Parse from a 32-character lowercase hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        decode_hex(s, &mut bytes)?;
        if bytes.iter().all(|b| *b == 0) {
            return None;
        }
        Some(Self(bytes))
    }

    /// Hex-encode (32 lowercase characters)
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An 8-byte span identifier, hex-encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    /// Generate a new random span id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Parse from a 16-character lowercase hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        let mut bytes = [0u8; 8];
        decode_hex(s, &mut bytes)?;
        if bytes.iter().all(|b| *b == 0) {
            return None;
        }
        Some(Self(bytes))
    }

    /// Hex-encode (16 lowercase characters)
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_hex(s: &str, out: &mut [u8]) -> Option<()> {
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)? as u8;
        let lo = (chunk[1] as char).to_digit(16)? as u8;
        out[i] = (hi << 4) | lo;
    }
    Some(())
}

/// The role of a span relative to its trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Top-level unit (a workflow run)
    Internal,

    /// Outbound call to a collaborator (node function, notifier, webhook)
    Client,

    /// Work performed on behalf of an external request (trigger)
    Server,

    /// Fan-out producer side
    Producer,

    /// Fan-in consumer side
    Consumer,
}

/// Terminal status of a span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SpanStatus {
    /// Not yet ended, or ended without an explicit verdict
    Unset,

    /// Completed successfully
    Ok,

    /// Completed with an error
    Error {
        /// Short error description
        message: String,
    },
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// A timestamped event attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name
    pub name: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// Event attributes
    pub attributes: BTreeMap<String, AttrValue>,
}

/// A link from a span to another span (possibly in another trace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLink {
    /// Linked trace id
    pub trace_id: TraceId,

    /// Linked span id
    pub span_id: SpanId,
}

/// A finished unit of trace data
///
/// Spans are built through [`Span::start`], annotated while the work runs,
/// and closed with [`Span::end`] (or one of the status-setting variants)
/// before being handed to an exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Trace this span belongs to
    pub trace_id: TraceId,

    /// This span's id
    pub span_id: SpanId,

    /// Parent span id, if any
    pub parent_span_id: Option<SpanId>,

    /// Operation name (e.g. `workflow.run`, `node.execute`)
    pub name: String,

    /// Span kind
    pub kind: SpanKind,

    /// Start timestamp
    pub start_time: DateTime<Utc>,

    /// End timestamp (None while the span is open)
    pub end_time: Option<DateTime<Utc>>,

    /// Terminal status
    pub status: SpanStatus,

    /// Typed attributes
    pub attributes: BTreeMap<String, AttrValue>,

    /// Timestamped events
    pub events: Vec<SpanEvent>,

    /// Links to related spans
    pub links: Vec<SpanLink>,
}

impl Span {
    /// Start a new root span in a fresh trace
    pub fn start(name: impl Into<String>, kind: SpanKind) -> Self {
        Self {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            name: name.into(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Start a child span within an existing trace
    pub fn start_child(
        name: impl Into<String>,
        kind: SpanKind,
        trace_id: TraceId,
        parent_span_id: SpanId,
    ) -> Self {
        Self {
            trace_id,
            span_id: SpanId::generate(),
            parent_span_id: Some(parent_span_id),
            name: name.into(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: BTreeMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Set an attribute
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Builder-style attribute setter
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Record a named event at the current instant
    pub fn add_event(&mut self, name: impl Into<String>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: BTreeMap::new(),
        });
    }

    /// Record a named event with attributes
    pub fn add_event_with_attributes(
        &mut self,
        name: impl Into<String>,
        attributes: BTreeMap<String, AttrValue>,
    ) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes,
        });
    }

    /// Link this span to another span
    pub fn add_link(&mut self, trace_id: TraceId, span_id: SpanId) {
        self.links.push(SpanLink { trace_id, span_id });
    }

    /// End the span with `Ok` status
    pub fn end_ok(&mut self) {
        self.status = SpanStatus::Ok;
        self.end_time = Some(Utc::now());
    }

    /// End the span with an error status
    pub fn end_error(&mut self, message: impl Into<String>) {
        self.status = SpanStatus::Error {
            message: message.into(),
        };
        self.end_time = Some(Utc::now());
    }

    /// End the span without changing its status
    pub fn end(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Span duration, if ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Whether the span has ended
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_hex_round_trip() {
        let id = TraceId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(TraceId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_span_id_hex_round_trip() {
        let id = SpanId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(SpanId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(TraceId::from_hex("not-hex").is_none());
        assert!(TraceId::from_hex("abcd").is_none());
        assert!(TraceId::from_hex(&"0".repeat(32)).is_none()); // all-zero invalid
        assert!(SpanId::from_hex(&"0".repeat(16)).is_none());
    }

    #[test]
    fn test_span_lifecycle() {
        let mut span = Span::start("workflow.run", SpanKind::Internal);
        assert!(!span.is_ended());
        assert_eq!(span.status, SpanStatus::Unset);

        span.set_attribute("workflow.name", "order_pipeline");
        span.set_attribute("node.index", 3i64);
        span.add_event("checkpoint.saved");
        span.end_ok();

        assert!(span.is_ended());
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.events.len(), 1);
        assert_eq!(
            span.attributes.get("workflow.name"),
            Some(&AttrValue::String("order_pipeline".to_string()))
        );
    }

    #[test]
    fn test_child_span_inherits_trace() {
        let parent = Span::start("workflow.run", SpanKind::Internal);
        let child = Span::start_child(
            "node.execute",
            SpanKind::Client,
            parent.trace_id,
            parent.span_id,
        );

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id, Some(parent.span_id));
        assert_ne!(child.span_id, parent.span_id);
    }

    #[test]
    fn test_span_error_status() {
        let mut span = Span::start("node.execute", SpanKind::Client);
        span.end_error("boom");

        assert!(matches!(span.status, SpanStatus::Error { ref message } if message == "boom"));
        assert!(span.duration().is_some());
    }

    #[test]
    fn test_span_serialization() {
        let mut span = Span::start("node.execute", SpanKind::Client)
            .with_attribute("node.name", "fetch")
            .with_attribute("retry.attempt", 2i64);
        span.end_ok();

        let json = serde_json::to_string(&span).unwrap();
        let parsed: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(span, parsed);
    }
}
