use tracing_subscriber::EnvFilter;

use crate::error::ProctorError;

pub fn unix_timestamp_now() -> i64 {
    let dur = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d,
        Err(_) => std::time::Duration::from_secs(0),
    };
    i64::try_from(dur.as_secs()).unwrap_or(i64::MAX)
}

#[allow(clippy::missing_errors_doc)]
pub fn init_telemetry() -> Result<(), ProctorError> {
    let filter = EnvFilter::try_from_env("PROCTOR_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_writer(std::io::stdout)
        .try_init()
        .map_err(|e| ProctorError::ConfigError {
            message: format!("初始化 telemetry 失败: {e}"),
        })
}
