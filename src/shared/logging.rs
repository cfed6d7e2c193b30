use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for a sandbox tool (file + console when the log
/// directory is writable, console only otherwise). Controlled via RUST_LOG.
pub fn init_tool_logging(log_dir: &str, tool_name: &str) -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let can_write_logs = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(format!("{log_dir}/.test_write")))
        .map(|_| std::fs::remove_file(format!("{log_dir}/.test_write")))
        .is_ok();

    if can_write_logs {
        use tracing_appender::rolling;

        let _ = rotate_logs_on_startup(log_dir, tool_name);

        let file_appender = rolling::daily(log_dir, format!("{tool_name}.log"));
        let (non_blocking_file, _guard_file) = non_blocking(file_appender);
        let (non_blocking_stdout, _guard_stdout) = non_blocking(std::io::stdout());

        let file_layer = fmt::layer()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .init();

        // Keep the appender guards alive for the whole process.
        std::mem::forget(_guard_file);
        std::mem::forget(_guard_stdout);

        info!("Logging initialized - logs written to {log_dir}/{tool_name}.log");
    } else {
        let (non_blocking_stdout, _guard_stdout) = non_blocking(std::io::stdout());

        let console_layer = fmt::layer()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        std::mem::forget(_guard_stdout);
    }

    Ok(())
}

pub fn rotate_logs_on_startup(log_dir: &str, tool_name: &str) -> Result<(), anyhow::Error> {
    let log_file = format!("{log_dir}/{tool_name}.log");
    let log_path = Path::new(&log_file);

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{tool_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup_file)?;
    }

    Ok(())
}
