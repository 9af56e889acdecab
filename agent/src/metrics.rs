use hyper::StatusCode;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Per-handler response counters, bucketed by status class.
#[derive(Clone, Debug, Default)]
pub struct HandlerMetrics {
    responses: Family<ResponseLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResponseLabels {
    handler: &'static str,
    status: &'static str,
}

// === impl HandlerMetrics ===

impl HandlerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "handler_responses",
            "Total HTTP responses served, by handler and status class",
            metrics.responses.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, handler: &'static str, status: StatusCode) {
        self.responses
            .get_or_create(&ResponseLabels {
                handler,
                status: status_bucket(status),
            })
            .inc();
    }
}

fn status_bucket(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}
