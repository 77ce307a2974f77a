use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::warn;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder once per process and returns its render handle.
pub fn init_metrics() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new()
                .add_global_label("service", env!("CARGO_PKG_NAME"))
                .build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("A global metrics recorder is already installed, /metrics will be empty");
            }
            handle
        })
        .clone()
}

/// Middleware to collect HTTP request metrics
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    gauge!("http_requests_active").increment(1.0);
    let response = next.run(req).await;
    gauge!("http_requests_active").decrement(1.0);

    let labels = [
        ("method", method.as_str().to_string()),
        ("path", path),
        ("status", response.status().as_str().to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());

    response
}

fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

/// `result` is `success` or the wire error code.
pub fn track_auth_attempt(result: &'static str) {
    counter!("auth_attempts_total", "result" => result).increment(1);
}

pub fn track_token_issued() {
    counter!("tokens_issued_total").increment(1);
}

/// `scope` is `token` or `user`.
pub fn track_tokens_revoked(scope: &'static str, count: u64) {
    if count > 0 {
        counter!("tokens_revoked_total", "scope" => scope).increment(count);
    }
}

/// `result` is `success` or the verifier error code.
pub fn track_token_verification(result: &'static str) {
    counter!("token_verifications_total", "result" => result).increment(1);
}

pub fn track_revocation_operation(operation: &'static str, success: bool, duration: Duration) {
    counter!(
        "revocation_store_operations_total",
        "operation" => operation,
        "result" => outcome(success)
    )
    .increment(1);
    histogram!("revocation_store_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

pub fn track_user_store_operation(operation: &'static str, success: bool, duration: Duration) {
    counter!(
        "user_store_operations_total",
        "operation" => operation,
        "result" => outcome(success)
    )
    .increment(1);
    histogram!("user_store_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

pub fn set_active_tokens(count: u64) {
    gauge!("active_tokens").set(count as f64);
}

pub fn track_cleanup_run(success: bool, expired_count: u64) {
    counter!("cleanup_runs_total", "result" => outcome(success)).increment(1);
    if expired_count > 0 {
        counter!("cleanup_expired_entries_total").increment(expired_count);
    }
}

pub fn track_rate_limit_exceeded() {
    counter!("rate_limit_exceeded_total").increment(1);
}

pub fn set_dependency_up(dependency: &str, up: bool) {
    gauge!("dependency_up", "dependency" => dependency.to_string()).set(if up { 1.0 } else { 0.0 });
}

pub fn track_handler_panic() {
    counter!("http_handler_panics_total").increment(1);
}

pub fn track_public_key_refresh(success: bool) {
    counter!("public_key_refreshes_total", "result" => outcome(success)).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let _first = init_metrics();
        let second = init_metrics();
        track_token_issued();
        assert!(second.render().contains("tokens_issued_total"));
    }

    #[test]
    fn test_recorded_metrics_render() {
        let handle = init_metrics();
        track_auth_attempt("success");
        track_tokens_revoked("user", 3);
        track_revocation_operation("is_revoked", true, Duration::from_millis(3));
        set_dependency_up("redis", true);

        let rendered = handle.render();
        assert!(rendered.contains("auth_attempts_total"));
        assert!(rendered.contains("tokens_revoked_total"));
        assert!(rendered.contains("dependency_up"));
    }

    #[test]
    fn test_tracking_helpers_do_not_panic() {
        track_token_verification("token_revoked");
        track_user_store_operation("upsert", false, Duration::from_millis(12));
        set_active_tokens(42);
        track_cleanup_run(true, 0);
        track_cleanup_run(false, 5);
        track_rate_limit_exceeded();
        track_public_key_refresh(false);
        track_handler_panic();
        track_tokens_revoked("token", 0);
    }
}
