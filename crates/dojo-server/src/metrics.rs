//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup, before any metric is recorded. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the text exposition format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names recorded by this crate. The session engine records its own
// `dojo_sessions_*`, `dojo_commands_*` and `dojo_validations_*` series.

/// HTTP requests handled (counter, labels: route).
pub const HTTP_REQUESTS_TOTAL: &str = "dojo_http_requests_total";
/// HTTP error responses (counter, labels: code).
pub const HTTP_ERRORS_TOTAL: &str = "dojo_http_errors_total";
/// Open event streams (gauge).
pub const EVENT_STREAMS_ACTIVE: &str = "dojo_event_streams_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => "health").increment(2);
        });
        let output = render(&handle);
        assert!(output.contains("dojo_http_requests_total"));
        assert!(output.contains("route=\"health\""));
    }

    #[test]
    fn metric_names_are_snake_case() {
        for name in [HTTP_REQUESTS_TOTAL, HTTP_ERRORS_TOTAL, EVENT_STREAMS_ACTIVE] {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
