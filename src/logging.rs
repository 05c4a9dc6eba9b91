use crate::config::TxConfig;
use anyhow::Result;
use std::fs;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Install a daily-rolling file layer plus a compact stdout layer.
/// Called once from `main` before any transaction work starts.
pub fn init_logging(config: &TxConfig) -> Result<()> {
    let log_level = parse_log_level(&config.general.log_level);
    let log_dir = TxConfig::data_dir()?.join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "debtx.log");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("debtx={}", log_level)));

    let file_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(file_appender)
        .with_ansi(false);

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(config.ui.use_colors)
        .compact();

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(())
}

fn parse_log_level(level_str: &str) -> &'static str {
    match level_str.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Structured log line for a step's lifecycle transition.
#[macro_export]
macro_rules! log_step {
    ($level:ident, $transaction_id:expr, $step_index:expr, $tag:expr, $message:expr) => {
        tracing::$level!(
            transaction_id = $transaction_id,
            step_index = $step_index,
            tag = $tag,
            "{}", $message
        );
    };
}

/// Structured log line for a transaction-level lifecycle transition.
#[macro_export]
macro_rules! log_transaction {
    ($transaction_id:expr, $status:expr) => {
        tracing::info!(
            transaction_id = $transaction_id,
            status = $status,
            "transaction {} -> {}", $transaction_id, $status
        );
    };
}
