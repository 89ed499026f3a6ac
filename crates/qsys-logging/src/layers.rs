//! Custom tracing layers
//!
//! [`CoreContextLayer`] stamps new spans with the active core context; the
//! JSONL helpers build the formatter layers used for console and file
//! output.

use tracing::{Subscriber, span};
use tracing_subscriber::{
    fmt::{
        MakeWriter,
        format::{Format, Json, JsonFields},
    },
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::config::JsonlConfig;
use crate::context::{CoreContextData, CoreContextGuard};

/// Layer that attaches the active [`CoreContextGuard`] data to new spans
pub struct CoreContextLayer;

impl CoreContextLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CoreContextLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct CoreContextExtension {
    pub data: CoreContextData,
}

impl<S> Layer<S> for CoreContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        // Inherit from the parent when no guard is active on this thread,
        // so spans opened inside spawned tasks keep the core they belong to.
        let data = CoreContextGuard::current().or_else(|| {
            span.parent()
                .and_then(|parent| parent.extensions().get::<CoreContextExtension>().cloned())
                .map(|ext| ext.data)
        });
        if let Some(data) = data {
            span.extensions_mut().insert(CoreContextExtension { data });
        }
    }
}

/// JSONL formatter layer type produced by [`jsonl_layer`]
pub type JsonlLayer<S, W> = tracing_subscriber::fmt::Layer<S, JsonFields, Format<Json>, W>;

/// Create a JSONL formatting layer writing to `writer`
pub fn jsonl_layer<S, W>(writer: W, config: &JsonlConfig) -> JsonlLayer<S, W>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(config.include_spans)
        .flatten_event(config.flatten_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_writer(writer)
}
