//! Tracer and W3C trace-context propagation
//!
//! The tracer owns an exporter and hands out spans. Trace context crosses
//! subworkflow and trigger boundaries as a `traceparent` header value.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::exporter::SpanExporter;
use crate::span::{Span, SpanId, SpanKind, TraceId};

/// Propagated trace context
///
/// Carries enough of a parent span's identity to continue the trace in
/// another component or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace id
    pub trace_id: TraceId,

    /// Parent span id
    pub span_id: SpanId,

    /// Trace flags (bit 0 = sampled)
    pub trace_flags: u8,
}

impl TraceContext {
    /// Context for a span
    pub fn for_span(span: &Span) -> Self {
        Self {
            trace_id: span.trace_id,
            span_id: span.span_id,
            trace_flags: 0x01,
        }
    }

    /// Whether the sampled flag is set
    pub fn is_sampled(&self) -> bool {
        self.trace_flags & 0x01 != 0
    }

    /// Format as a `traceparent` header value
    ///
    /// Version 00 textual format: `00-<trace-id>-<parent-id>-<flags>`.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id.to_hex(),
            self.span_id.to_hex(),
            self.trace_flags
        )
    }

    /// Parse a `traceparent` header value
    ///
    /// Accepts version 00; unknown versions are parsed leniently as long
    /// as the first four fields are well-formed, per the W3C spec.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().splitn(4, '-');
        let version = parts.next()?;
        if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        // Version ff is explicitly invalid.
        if version.eq_ignore_ascii_case("ff") {
            return None;
        }

        let trace_id = TraceId::from_hex(parts.next()?)?;
        let span_id = SpanId::from_hex(parts.next()?)?;
        let flags_field = parts.next()?;
        if flags_field.len() < 2 || !flags_field.is_ascii() {
            return None;
        }
        let trace_flags = u8::from_str_radix(&flags_field[..2], 16).ok()?;

        Some(Self {
            trace_id,
            span_id,
            trace_flags,
        })
    }
}

/// Hands out spans and forwards finished spans to an exporter
///
/// # Example
///
/// ```ignore
/// let tracer = Tracer::new(Arc::new(ConsoleSpanExporter::new()));
/// let mut span = tracer.start_span("workflow.run", SpanKind::Internal, None);
/// // ... work ...
/// span.end_ok();
/// tracer.finish(span).await;
/// ```
pub struct Tracer {
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    /// Create a tracer backed by the given exporter
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }

    /// Start a span, continuing `parent` when present
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&TraceContext>,
    ) -> Span {
        match parent {
            Some(ctx) => Span::start_child(name, kind, ctx.trace_id, ctx.span_id),
            None => Span::start(name, kind),
        }
    }

    /// Export a finished span
    ///
    /// Open spans are ended (status unchanged) before export. Export
    /// failures are logged and swallowed so tracing never fails a run.
    pub async fn finish(&self, mut span: Span) {
        if !span.is_ended() {
            span.end();
        }
        if let Err(e) = self.exporter.export(vec![span]).await {
            warn!("span export failed: {e}");
        }
    }

    /// Export a batch of finished spans
    pub async fn finish_batch(&self, spans: Vec<Span>) {
        if spans.is_empty() {
            return;
        }
        if let Err(e) = self.exporter.export(spans).await {
            warn!("span export failed: {e}");
        }
    }

    /// Flush the underlying exporter
    pub async fn flush(&self) {
        if let Err(e) = self.exporter.flush().await {
            warn!("span exporter flush failed: {e}");
        }
    }
}

// Process-wide tracer with an explicit init/teardown lifecycle. Tests
// construct local `Tracer` instances instead of touching the global.
static GLOBAL_TRACER: RwLock<Option<Arc<Tracer>>> = RwLock::new(None);

/// Install the process-wide tracer
///
/// Replaces any previously installed tracer and returns the old one.
pub fn init_global_tracer(tracer: Arc<Tracer>) -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.write().replace(tracer)
}

/// Get the process-wide tracer, if installed
pub fn global_tracer() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.read().clone()
}

/// Remove the process-wide tracer
///
/// Returns the removed tracer so callers can flush it.
pub fn shutdown_global_tracer() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.write().take()
}
