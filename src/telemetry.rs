use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Installs the global metrics recorder and returns the handle that renders
/// the Prometheus exposition for `GET /metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::describe_counter!(
        "wallet_operations_total",
        "Balance-changing operations by operation and outcome"
    );
    metrics::describe_histogram!(
        "wallet_operation_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of balance-changing operations"
    );
    metrics::describe_counter!(
        "wallet_balance_cache_total",
        "Balance reads served from the cache (hit) or the store (miss)"
    );
    metrics::describe_counter!(
        "wallet_cache_invalidation_failures_total",
        "Committed mutations whose cache keys could not be invalidated"
    );
    Ok(handle)
}
