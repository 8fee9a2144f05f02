pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "termination_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "termination_shutdown_completed_total";
pub(crate) const METRIC_PHASE_DURATION: &str = "termination_phase_duration_seconds";
pub(crate) const METRIC_DUPLICATE_TRIGGERS: &str = "termination_duplicate_triggers_total";
pub(crate) const METRIC_WORK_UNITS_OUTSTANDING: &str = "termination_work_units_outstanding";

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, status: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_phase_duration(
    service_name: &str,
    phase: &str,
    result: &str,
    duration_secs: f64,
) {
    metrics::histogram!(
        METRIC_PHASE_DURATION,
        "service_name" => service_name.to_string(),
        "phase" => phase.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_duplicate_trigger(trigger: &str) {
    metrics::counter!(METRIC_DUPLICATE_TRIGGERS, "trigger" => trigger.to_string()).increment(1);
}

pub(crate) fn emit_outstanding_work(outstanding: usize) {
    metrics::gauge!(METRIC_WORK_UNITS_OUTSTANDING).set(outstanding as f64);
}
