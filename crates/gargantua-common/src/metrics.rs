//! Metrics registry for Gargantua observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile passes (duration, errors) per controller
//! - Work queues (adds, depth)
//! - Scheduling outcomes (binds by mode, dynamic bind results)
//! - Provisioning (VMs handed to Terraform, VMs running)

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

/// Global meter for Gargantua metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("gargantua"));

// ============================================================================
// Controller Metrics
// ============================================================================

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `controller`: vmset, vmclaim, dynamicbind, provisioner, environment
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gargantua_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconcile passes
///
/// Labels:
/// - `controller`: controller name
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gargantua_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Work Queue Metrics
// ============================================================================

/// Counter of keys added to a work queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gargantua_workqueue_adds_total")
        .with_description("Total number of keys added to work queues")
        .with_unit("{keys}")
        .build()
});

/// Gauge of keys waiting in a work queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("gargantua_workqueue_depth")
        .with_description("Number of keys waiting in a work queue")
        .with_unit("{keys}")
        .build()
});

// ============================================================================
// Scheduling Metrics
// ============================================================================

/// Counter of VMs bound to claims
///
/// Labels:
/// - `mode`: static, dynamic
pub static VM_BINDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gargantua_vm_binds_total")
        .with_description("Total number of VMs bound to claims")
        .with_unit("{vms}")
        .build()
});

/// Counter of DynamicBindRequests reaching a terminal state
///
/// Labels:
/// - `outcome`: fulfilled, expired
pub static DYNAMIC_BIND_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gargantua_dynamic_bind_outcomes_total")
        .with_description("Total number of dynamic bind requests by outcome")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Provisioning Metrics
// ============================================================================

/// Counter of VM provisioning transitions
///
/// Labels:
/// - `phase`: provisioned, running, deleted
pub static VM_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gargantua_vm_transitions_total")
        .with_description("Total number of VM provisioning transitions")
        .with_unit("{vms}")
        .build()
});

/// How a claim got its VMs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMode {
    /// Pre-provisioned pool VMs
    Static,
    /// VMs created on demand
    Dynamic,
}

impl BindMode {
    /// Get the label value
    pub fn as_str(&self) -> &'static str {
        match self {
            BindMode::Static => "static",
            BindMode::Dynamic => "dynamic",
        }
    }
}

/// Terminal state of a DynamicBindRequest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DynamicBindOutcome {
    /// VMs were created
    Fulfilled,
    /// Attempts ran out
    Expired,
}

impl DynamicBindOutcome {
    /// Get the label value
    pub fn as_str(&self) -> &'static str {
        match self {
            DynamicBindOutcome::Fulfilled => "fulfilled",
            DynamicBindOutcome::Expired => "expired",
        }
    }
}

/// Timer for one reconcile pass
pub struct ReconcileTimer {
    controller: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a pass of `controller`
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record a successful pass
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed pass
    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new(
                    "error_type",
                    if retryable { "transient" } else { "permanent" },
                ),
            ],
        );
    }
}

/// Record a key added to `queue`
pub fn record_queue_add(queue: &str) {
    QUEUE_ADDS.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Update the depth gauge of `queue`
pub fn set_queue_depth(queue: &str, depth: usize) {
    QUEUE_DEPTH.record(
        i64::try_from(depth).unwrap_or(i64::MAX),
        &[KeyValue::new("queue", queue.to_string())],
    );
}

/// Record `count` VMs bound to a claim
pub fn record_binds(mode: BindMode, count: u64) {
    VM_BINDS.add(count, &[KeyValue::new("mode", mode.as_str())]);
}

/// Record a DynamicBindRequest reaching a terminal state
pub fn record_dynamic_bind(outcome: DynamicBindOutcome) {
    DYNAMIC_BIND_OUTCOMES.add(1, &[KeyValue::new("outcome", outcome.as_str())]);
}

/// Record a VM provisioning transition
pub fn record_vm_transition(phase: &'static str) {
    VM_TRANSITIONS.add(1, &[KeyValue::new("phase", phase)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values() {
        assert_eq!(BindMode::Static.as_str(), "static");
        assert_eq!(BindMode::Dynamic.as_str(), "dynamic");
        assert_eq!(DynamicBindOutcome::Expired.as_str(), "expired");
    }

    #[test]
    fn test_reconcile_timer() {
        let timer = ReconcileTimer::start("vmset");
        assert_eq!(timer.controller, "vmset");
        // Just ensure it doesn't panic without an exporter
        timer.success();
        ReconcileTimer::start("vmclaim").error(true);
    }

    #[test]
    fn test_recorders_without_exporter() {
        record_queue_add("vmset");
        set_queue_depth("vmset", 3);
        record_binds(BindMode::Static, 2);
        record_dynamic_bind(DynamicBindOutcome::Fulfilled);
        record_vm_transition("running");
    }
}
