//! OTel-native metrics instruments.
//!
//! Lazily initialized and feature-gated behind `otel`. Without a meter
//! provider installed by the host process the instruments are no-ops.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("killfeed"));

/// Settled deliveries, by queue and outcome.
pub static WORKER_OUTCOME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("killfeed.worker.outcome.total")
        .with_description("Deliveries settled by workers")
        .build()
});

/// Wall time of a workflow stage, action plus drain.
pub static STAGE_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("killfeed.orchestrator.stage.duration")
        .with_description("Workflow stage duration")
        .with_unit("s")
        .build()
});

pub fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}

pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

pub fn stage_attr(stage: &str) -> KeyValue {
    KeyValue::new("stage", stage.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_record_without_provider() {
        WORKER_OUTCOME_TOTAL.add(1, &[queue_attr("organization"), outcome_attr("processed")]);
        STAGE_DURATION.record(0.5, &[stage_attr("entities"), outcome_attr("drained")]);
    }

    #[test]
    fn test_attrs_carry_their_keys() {
        assert_eq!(queue_attr("value").key.as_str(), "queue");
        assert_eq!(outcome_attr("retry").key.as_str(), "outcome");
        assert_eq!(stage_attr("values").key.as_str(), "stage");
    }
}
