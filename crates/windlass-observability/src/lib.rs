// Observability for Windlass
//
// Spans, trace-context propagation, and metrics for the workflow engine.
// Key design decisions:
// - First-party span/metric types keep the engine decoupled from any
//   particular collector SDK; exporters speak HTTP directly
// - Trace context crosses subworkflow and trigger boundaries as a W3C
//   traceparent header value
// - Globals (tracer, metrics) have explicit init/teardown; tests inject
//   local instances and never touch the globals

pub mod exporter;
pub mod metrics;
pub mod span;
pub mod tracer;

// Re-exports
pub use exporter::{
    CollectingSpanExporter, CompositeSpanExporter, ConsoleSpanExporter, ExportError,
    OtlpHttpSpanExporter, SpanExporter, ZipkinSpanExporter,
};
pub use metrics::{
    global_metrics, init_global_metrics, shutdown_global_metrics, ConsoleMetricsExporter,
    HistogramSummary, MetricsExporter, MetricsRegistry, MetricsSnapshot,
};
pub use span::{AttrValue, Span, SpanEvent, SpanId, SpanKind, SpanLink, SpanStatus, TraceId};
pub use tracer::{
    global_tracer, init_global_tracer, shutdown_global_tracer, TraceContext, Tracer,
};
