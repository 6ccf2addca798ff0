//! Comprehensive unit tests for metrics.rs module

use std::time::Duration;

use sql_query_assistant::metrics::MetricsCollector;
use sql_query_assistant::models::{BuildSummary, RequestState};
use sql_query_assistant::pool::PoolStatus;

#[test]
fn test_metrics_collector_default() {
    let collector = MetricsCollector::default();
    assert_eq!(collector.stage_duration, "sql_assistant_stage_duration_seconds");
    assert_eq!(collector.requests_total, "sql_assistant_requests_total");
    assert_eq!(collector.cache_rebuilt_total, "sql_assistant_cache_rebuilt_total");
    assert_eq!(collector.errors_total, "sql_assistant_errors_total");
}

#[test]
fn test_metric_names_share_prefix() {
    let collector = MetricsCollector::default();
    let names = [
        collector.stage_duration,
        collector.requests_total,
        collector.cache_reused_total,
        collector.cache_rebuilt_total,
        collector.cache_degraded_total,
        collector.cache_failed_total,
        collector.cache_build_duration,
        collector.completion_attempts_total,
        collector.pool_size,
        collector.pool_leased,
        collector.pool_acquire_timeouts_total,
        collector.errors_total,
    ];
    assert!(names.iter().all(|name| name.starts_with("sql_assistant_")));
}

#[test]
fn test_record_stage() {
    let collector = MetricsCollector::default();
    collector.record_stage("retrieval", Duration::from_millis(12));
    collector.record_stage("execution", Duration::ZERO);
}

#[test]
fn test_record_request_outcomes() {
    let collector = MetricsCollector::default();
    for outcome in [RequestState::Succeeded, RequestState::Rejected, RequestState::Failed] {
        collector.record_request(outcome);
    }
}

#[test]
fn test_record_cache_build() {
    let collector = MetricsCollector::default();
    collector.record_cache_build(&BuildSummary {
        catalog_version: "v1".to_string(),
        reused: 2,
        rebuilt: 1,
        degraded: 0,
        failed: vec!["Orders".to_string()],
        pruned: 0,
        elapsed: Duration::from_millis(40),
    });
}

#[test]
fn test_record_pool_and_errors() {
    let collector = MetricsCollector::default();
    collector.update_pool(&PoolStatus {
        max_size: 5,
        connections: 2,
        idle: 1,
        leased: 1,
        ..PoolStatus::default()
    });
    collector.record_pool_timeout();
    collector.record_completion_attempt("retry");
    collector.record_error("validation_rejected", RequestState::Validating);
}
