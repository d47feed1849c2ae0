//! Plugin Layer Metrics
//!
//! Prometheus collectors registered in the default registry on first use and
//! exported by the sidecar's `/metrics` endpoint.

use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use std::sync::LazyLock;

// =============================================================================
// Collectors
// =============================================================================

static SESSION_LOGINS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "storage_backend_session_logins_total",
        "Array logins by backend and result",
        &["backend", "result"],
    )
});

static SESSION_LOGOUTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "storage_backend_session_logouts_total",
        "Array logouts by backend",
        &["backend"],
    )
});

static SESSION_HOLDERS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    gauge_vec(
        "storage_backend_session_holders",
        "Current session holders by backend",
        &["backend"],
    )
});

static DISPATCH_STRATEGY: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "storage_backend_dispatch_strategy_total",
        "Dispatcher strategy selections",
        &["operation", "strategy"],
    )
});

static OPERATION_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "storage_backend_operation_failures_total",
        "Failed plugin operations by backend and operation",
        &["backend", "operation"],
    )
});

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("static counter definition is valid");
    let _ = prometheus::register(Box::new(counter.clone()));
    counter
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)
        .expect("static gauge definition is valid");
    let _ = prometheus::register(Box::new(gauge.clone()));
    gauge
}

// =============================================================================
// Recorders
// =============================================================================

pub fn record_login(backend: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    SESSION_LOGINS.with_label_values(&[backend, result]).inc();
}

pub fn record_logout(backend: &str) {
    SESSION_LOGOUTS.with_label_values(&[backend]).inc();
}

pub fn set_session_holders(backend: &str, holders: u32) {
    SESSION_HOLDERS
        .with_label_values(&[backend])
        .set(i64::from(holders));
}

pub fn record_strategy(operation: &str, strategy: &str) {
    DISPATCH_STRATEGY
        .with_label_values(&[operation, strategy])
        .inc();
}

pub fn record_operation_failure(backend: &str, operation: &str) {
    OPERATION_FAILURES
        .with_label_values(&[backend, operation])
        .inc();
}

/// Logins recorded so far for a backend and result
pub fn login_count(backend: &str, success: bool) -> u64 {
    let result = if success { "success" } else { "failure" };
    SESSION_LOGINS.with_label_values(&[backend, result]).get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_update_collectors() {
        let before = login_count("metrics-test", true);
        record_login("metrics-test", true);
        record_login("metrics-test", false);
        assert_eq!(login_count("metrics-test", true), before + 1);

        set_session_holders("metrics-test", 3);
        assert_eq!(SESSION_HOLDERS.with_label_values(&["metrics-test"]).get(), 3);

        record_strategy("attach", "dual-array");
        assert!(
            DISPATCH_STRATEGY
                .with_label_values(&["attach", "dual-array"])
                .get()
                >= 1
        );
    }
}
