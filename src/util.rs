use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured tracing on stderr based on RUST_LOG.
///
/// Only called in headless mode: the TUI owns the terminal and a tracing
/// layer writing to stderr would tear the dashboard apart.
pub fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(status).json(body)
}

/// "741", "12.3K", "1.2M".
pub fn fmt_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Dollar amount with precision scaled to magnitude.
pub fn fmt_cost(cost: f64) -> String {
    if cost >= 10.0 {
        format!("${cost:.2}")
    } else if cost >= 1.0 {
        format!("${cost:.3}")
    } else if cost >= 0.01 {
        format!("${cost:.4}")
    } else if cost == 0.0 {
        "$0.00".to_string()
    } else {
        format!("${cost:.5}")
    }
}

/// "230ms", "1.4s", "2.1m".
pub fn fmt_latency(latency: Duration) -> String {
    if latency >= Duration::from_secs(60) {
        format!("{:.1}m", latency.as_secs_f64() / 60.0)
    } else if latency >= Duration::from_secs(1) {
        format!("{:.1}s", latency.as_secs_f64())
    } else {
        format!("{}ms", latency.as_millis())
    }
}

/// Uptime style: "45s", "12m 3s", "1h 4m 9s".
pub fn fmt_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Pad or truncate a model name to a fixed column width so one long name
/// cannot desynchronize the headless log columns.
pub fn fmt_model_column(model: &str, width: usize) -> String {
    if model.chars().count() > width {
        model.chars().take(width).collect()
    } else {
        format!("{model:<width$}")
    }
}
