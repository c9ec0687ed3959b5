//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use crate::types::FunctionKind;
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Function lifecycle metrics
    describe_counter!(
        "pcie_edu_function_realized_total",
        "Total number of functions that reached the active state (by kind)"
    );
    describe_counter!(
        "pcie_edu_function_realize_failures_total",
        "Total number of failed realizes (by kind, reason)"
    );
    describe_counter!(
        "pcie_edu_function_exited_total",
        "Total number of functions destroyed (by kind)"
    );

    // SR-IOV metrics
    describe_counter!("pcie_edu_sriov_enable_total", "SR-IOV enable attempts (by status)");
    describe_gauge!("pcie_edu_vf_count", "Current number of realized virtual functions");

    // Resource metrics
    describe_gauge!("pcie_edu_msix_vectors_in_use", "MSI-X vectors currently reserved");
    describe_gauge!("pcie_edu_regions_held", "BAR regions currently reserved");
}

pub fn record_realized(kind: FunctionKind) {
    counter!("pcie_edu_function_realized_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_realize_failure(kind: FunctionKind, reason: &str) {
    counter!(
        "pcie_edu_function_realize_failures_total",
        "kind" => kind.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_exited(kind: FunctionKind) {
    counter!("pcie_edu_function_exited_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_sriov_enable(status: &str) {
    counter!("pcie_edu_sriov_enable_total", "status" => status.to_string()).increment(1);
}

pub fn set_vf_count(count: usize) {
    gauge!("pcie_edu_vf_count").set(count as f64);
}

pub fn set_vectors_in_use(count: u32) {
    gauge!("pcie_edu_msix_vectors_in_use").set(f64::from(count));
}

pub fn set_regions_held(count: usize) {
    gauge!("pcie_edu_regions_held").set(count as f64);
}
