//! Span exporters
//!
//! An exporter takes batches of finished spans and ships them somewhere:
//! stdout for local development, an OTLP/HTTP or Zipkin v2 endpoint over
//! HTTP, or a composite fan-out across several of the above.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::span::{AttrValue, Span, SpanStatus};

/// Errors that can occur during span export
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint rejected the payload
    #[error("endpoint returned status {0}")]
    Rejected(u16),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ships batches of finished spans
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Exporter name (for logging)
    fn name(&self) -> &'static str;

    /// Export a batch of spans
    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError>;

    /// Flush any buffered spans
    async fn flush(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Text exporter writing one line per span to stdout
#[derive(Debug, Default)]
pub struct ConsoleSpanExporter;

impl ConsoleSpanExporter {
    /// Create a console exporter
    pub fn new() -> Self {
        Self
    }

    fn format_span(span: &Span) -> String {
        let duration = span
            .duration()
            .map(|d| format!("{}ms", d.num_milliseconds()))
            .unwrap_or_else(|| "open".to_string());
        let status = match &span.status {
            SpanStatus::Unset => "unset".to_string(),
            SpanStatus::Ok => "ok".to_string(),
            SpanStatus::Error { message } => format!("error: {message}"),
        };
        let attrs: Vec<String> = span
            .attributes
            .iter()
            .map(|(k, v)| match v {
                AttrValue::String(s) => format!("{k}={s}"),
                AttrValue::Bool(b) => format!("{k}={b}"),
                AttrValue::Int(i) => format!("{k}={i}"),
                AttrValue::Float(f) => format!("{k}={f}"),
            })
            .collect();
        format!(
            "[span] {} trace={} span={} parent={} {} [{}] {}",
            span.name,
            span.trace_id,
            span.span_id,
            span.parent_span_id
                .map(|p| p.to_hex())
                .unwrap_or_else(|| "-".to_string()),
            duration,
            status,
            attrs.join(" ")
        )
    }
}

#[async_trait]
impl SpanExporter for ConsoleSpanExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        for span in &spans {
            println!("{}", Self::format_span(span));
        }
        Ok(())
    }
}

/// OTLP/HTTP exporter
///
/// Posts an OTLP JSON envelope (`resourceSpans`) to the collector's
/// `/v1/traces` path. Timestamps are nanoseconds since the epoch as
/// strings, per the OTLP JSON mapping.
pub struct OtlpHttpSpanExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl OtlpHttpSpanExporter {
    /// Create an exporter posting to `endpoint` (e.g. `http://localhost:4318/v1/traces`)
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: "windlass".to_string(),
        }
    }

    /// Set the resource service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    fn attr_json(value: &AttrValue) -> serde_json::Value {
        match value {
            AttrValue::Bool(b) => json!({ "boolValue": b }),
            AttrValue::Int(i) => json!({ "intValue": i.to_string() }),
            AttrValue::Float(f) => json!({ "doubleValue": f }),
            AttrValue::String(s) => json!({ "stringValue": s }),
        }
    }

    fn span_json(span: &Span) -> serde_json::Value {
        let attributes: Vec<serde_json::Value> = span
            .attributes
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": Self::attr_json(v) }))
            .collect();
        let events: Vec<serde_json::Value> = span
            .events
            .iter()
            .map(|e| {
                json!({
                    "name": e.name,
                    "timeUnixNano": nanos(e.timestamp),
                    "attributes": e.attributes.iter()
                        .map(|(k, v)| json!({ "key": k, "value": Self::attr_json(v) }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let links: Vec<serde_json::Value> = span
            .links
            .iter()
            .map(|l| json!({ "traceId": l.trace_id.to_hex(), "spanId": l.span_id.to_hex() }))
            .collect();
        let status = match &span.status {
            SpanStatus::Unset => json!({ "code": 0 }),
            SpanStatus::Ok => json!({ "code": 1 }),
            SpanStatus::Error { message } => json!({ "code": 2, "message": message }),
        };

        json!({
            "traceId": span.trace_id.to_hex(),
            "spanId": span.span_id.to_hex(),
            "parentSpanId": span.parent_span_id.map(|p| p.to_hex()).unwrap_or_default(),
            "name": span.name,
            "kind": match span.kind {
                crate::span::SpanKind::Internal => 1,
                crate::span::SpanKind::Server => 2,
                crate::span::SpanKind::Client => 3,
                crate::span::SpanKind::Producer => 4,
                crate::span::SpanKind::Consumer => 5,
            },
            "startTimeUnixNano": nanos(span.start_time),
            "endTimeUnixNano": span.end_time.map(nanos).unwrap_or_default(),
            "status": status,
            "attributes": attributes,
            "events": events,
            "links": links,
        })
    }
}

fn nanos(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.timestamp_nanos_opt().unwrap_or(0).to_string()
}

#[async_trait]
impl SpanExporter for OtlpHttpSpanExporter {
    fn name(&self) -> &'static str {
        "otlp_http"
    }

    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        let payload = json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [{
                        "key": "service.name",
                        "value": { "stringValue": self.service_name },
                    }],
                },
                "scopeSpans": [{
                    "scope": { "name": "windlass" },
                    "spans": spans.iter().map(Self::span_json).collect::<Vec<_>>(),
                }],
            }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExportError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Zipkin v2 exporter (JSON over HTTP)
///
/// Posts the span batch as a Zipkin v2 JSON array to the collector's
/// `/api/v2/spans` path. Timestamps are microseconds since the epoch.
pub struct ZipkinSpanExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl ZipkinSpanExporter {
    /// Create an exporter posting to `endpoint` (e.g. `http://localhost:9411/api/v2/spans`)
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            service_name: "windlass".to_string(),
        }
    }

    /// Set the local endpoint service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    fn span_json(&self, span: &Span) -> serde_json::Value {
        let micros = |ts: chrono::DateTime<chrono::Utc>| ts.timestamp_micros();
        let duration = span
            .duration()
            .map(|d| d.num_microseconds().unwrap_or(0).max(1))
            .unwrap_or(1);

        let mut tags = serde_json::Map::new();
        for (k, v) in &span.attributes {
            let s = match v {
                AttrValue::String(s) => s.clone(),
                AttrValue::Bool(b) => b.to_string(),
                AttrValue::Int(i) => i.to_string(),
                AttrValue::Float(f) => f.to_string(),
            };
            tags.insert(k.clone(), serde_json::Value::String(s));
        }
        if let SpanStatus::Error { message } = &span.status {
            tags.insert("error".to_string(), serde_json::Value::String(message.clone()));
        }

        json!({
            "traceId": span.trace_id.to_hex(),
            "id": span.span_id.to_hex(),
            "parentId": span.parent_span_id.map(|p| p.to_hex()),
            "name": span.name,
            "kind": match span.kind {
                crate::span::SpanKind::Client => "CLIENT",
                crate::span::SpanKind::Server => "SERVER",
                crate::span::SpanKind::Producer => "PRODUCER",
                crate::span::SpanKind::Consumer => "CONSUMER",
                crate::span::SpanKind::Internal => "CLIENT",
            },
            "timestamp": micros(span.start_time),
            "duration": duration,
            "localEndpoint": { "serviceName": self.service_name },
            "tags": tags,
            "annotations": span.events.iter().map(|e| {
                json!({ "timestamp": micros(e.timestamp), "value": e.name })
            }).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl SpanExporter for ZipkinSpanExporter {
    fn name(&self) -> &'static str {
        "zipkin"
    }

    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        let payload: Vec<serde_json::Value> = spans.iter().map(|s| self.span_json(s)).collect();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExportError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fan-out exporter delivering every batch to all children
///
/// A child failure does not stop delivery to the remaining children; the
/// first error is returned after all children have been attempted.
pub struct CompositeSpanExporter {
    exporters: Vec<Arc<dyn SpanExporter>>,
}

impl CompositeSpanExporter {
    /// Create a composite over the given exporters
    pub fn new(exporters: Vec<Arc<dyn SpanExporter>>) -> Self {
        Self { exporters }
    }
}

#[async_trait]
impl SpanExporter for CompositeSpanExporter {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        let mut first_error = None;
        for exporter in &self.exporters {
            if let Err(e) = exporter.export(spans.clone()).await {
                tracing::warn!(exporter = exporter.name(), "span export failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<(), ExportError> {
        for exporter in &self.exporters {
            exporter.flush().await?;
        }
        Ok(())
    }
}

/// Exporter that retains spans in memory (for tests)
#[derive(Default)]
pub struct CollectingSpanExporter {
    spans: Mutex<Vec<Span>>,
}

impl CollectingSpanExporter {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// All spans exported so far
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Number of spans exported so far
    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    /// Whether no spans have been exported
    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }
}

#[async_trait]
impl SpanExporter for CollectingSpanExporter {
    fn name(&self) -> &'static str {
        "collecting"
    }

    async fn export(&self, spans: Vec<Span>) -> Result<(), ExportError> {
        self.spans.lock().extend(spans);
        Ok(())
    }
}
