//! Prometheus metrics for policy evaluations.
//!
//! The key family `<filter>.eval_time.<bundle>` / `<filter>.decision.*` is
//! mapped onto labelled collectors: one timer histogram and one decision
//! counter, both labelled by filter name and bundle.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramOpts, HistogramVec, IntCounterVec,
};

const EVAL_TIME_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

static EVAL_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "opa_eval_time",
        "Policy evaluation latency in milliseconds per filter and bundle",
    )
    .buckets(EVAL_TIME_BUCKETS.to_vec());
    register_histogram_vec!(opts, &["filter", "bundle"]).unwrap()
});

static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "opa_decisions_total",
        "Policy decisions per filter, bundle and outcome",
        &["filter", "bundle", "decision"]
    )
    .unwrap()
});

/// Decision outcome labels.
pub const DECISION_ALLOW: &str = "allow";
pub const DECISION_DENY: &str = "deny";
pub const DECISION_ERR: &str = "err";

/// Record one evaluation's latency.
pub fn observe_eval_time(filter: &str, bundle: &str, elapsed: Duration) {
    EVAL_TIME
        .with_label_values(&[filter, bundle])
        .observe(elapsed.as_secs_f64() * 1000.0);
}

/// Count one decision outcome (`allow`, `deny` or `err`).
pub fn incr_decision(filter: &str, bundle: &str, outcome: &str) {
    DECISIONS
        .with_label_values(&[filter, bundle, outcome])
        .inc();
}

/// Current counter value, used by tests and status endpoints.
pub fn decision_count(filter: &str, bundle: &str, outcome: &str) -> u64 {
    DECISIONS
        .with_label_values(&[filter, bundle, outcome])
        .get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let before = decision_count("opaAuthorizeRequest", "metrics-test", DECISION_ALLOW);
        incr_decision("opaAuthorizeRequest", "metrics-test", DECISION_ALLOW);
        incr_decision("opaAuthorizeRequest", "metrics-test", DECISION_ALLOW);
        assert_eq!(
            decision_count("opaAuthorizeRequest", "metrics-test", DECISION_ALLOW),
            before + 2
        );
        observe_eval_time("opaAuthorizeRequest", "metrics-test", Duration::from_millis(3));
    }
}
