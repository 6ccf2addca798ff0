use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::models::{BuildSummary, RequestState};
use crate::pool::PoolStatus;

/// Metric names emitted by the pipeline.
///
/// Everything goes through the `metrics` facade; without an installed
/// recorder the calls are no-ops.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    // Pipeline metrics
    pub stage_duration: &'static str,
    pub requests_total: &'static str,

    // Cache metrics
    pub cache_reused_total: &'static str,
    pub cache_rebuilt_total: &'static str,
    pub cache_degraded_total: &'static str,
    pub cache_failed_total: &'static str,
    pub cache_build_duration: &'static str,

    // Completion metrics
    pub completion_attempts_total: &'static str,

    // Pool metrics
    pub pool_size: &'static str,
    pub pool_leased: &'static str,
    pub pool_acquire_timeouts_total: &'static str,

    // Error metrics
    pub errors_total: &'static str,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            stage_duration: "sql_assistant_stage_duration_seconds",
            requests_total: "sql_assistant_requests_total",

            cache_reused_total: "sql_assistant_cache_reused_total",
            cache_rebuilt_total: "sql_assistant_cache_rebuilt_total",
            cache_degraded_total: "sql_assistant_cache_degraded_total",
            cache_failed_total: "sql_assistant_cache_failed_total",
            cache_build_duration: "sql_assistant_cache_build_duration_seconds",

            completion_attempts_total: "sql_assistant_completion_attempts_total",

            pool_size: "sql_assistant_pool_connections",
            pool_leased: "sql_assistant_pool_leased",
            pool_acquire_timeouts_total: "sql_assistant_pool_acquire_timeouts_total",

            errors_total: "sql_assistant_errors_total",
        }
    }
}

impl MetricsCollector {
    /// Record how long one pipeline stage took
    pub fn record_stage(&self, stage: &'static str, duration: Duration) {
        histogram!(self.stage_duration, "stage" => stage).record(duration.as_secs_f64());
    }

    /// Record the terminal state of a request
    pub fn record_request(&self, outcome: RequestState) {
        counter!(self.requests_total, "outcome" => outcome.to_string()).increment(1);
    }

    /// Record the counts of a cache build
    pub fn record_cache_build(&self, summary: &BuildSummary) {
        counter!(self.cache_reused_total).increment(summary.reused as u64);
        counter!(self.cache_rebuilt_total).increment(summary.rebuilt as u64);
        counter!(self.cache_degraded_total).increment(summary.degraded as u64);
        counter!(self.cache_failed_total).increment(summary.failed.len() as u64);
        histogram!(self.cache_build_duration).record(summary.elapsed.as_secs_f64());
    }

    /// Record one completion call and how it ended
    pub fn record_completion_attempt(&self, outcome: &'static str) {
        counter!(self.completion_attempts_total, "outcome" => outcome).increment(1);
    }

    /// Record an acquire that ran out of time
    pub fn record_pool_timeout(&self) {
        counter!(self.pool_acquire_timeouts_total).increment(1);
    }

    /// Update pool gauges from a status snapshot
    pub fn update_pool(&self, status: &PoolStatus) {
        gauge!(self.pool_size).set(f64::from(status.connections));
        gauge!(self.pool_leased).set(f64::from(status.leased));
    }

    /// Record error metrics
    pub fn record_error(&self, error_type: &'static str, stage: RequestState) {
        counter!(self.errors_total, "type" => error_type, "stage" => stage.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::default();
        assert_eq!(collector.requests_total, "sql_assistant_requests_total");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let collector = MetricsCollector::default();
        collector.record_stage("retrieval", Duration::from_millis(3));
        collector.record_request(RequestState::Succeeded);
        collector.record_cache_build(&BuildSummary::default());
    }
}
