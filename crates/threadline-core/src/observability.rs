use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool_env;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "threadline.logs.jsonl";

fn observability_enabled() -> bool {
    for key in ["THREADLINE_OBSERVABILITY_ENABLED", "THREADLINE_OBSERVABILITY"] {
        if let Ok(value) = std::env::var(key) {
            return parse_bool_env(&value).unwrap_or(true);
        }
    }
    true
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("THREADLINE_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Splits a log path into the directory and file name handed to the appender.
fn log_target(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `THREADLINE_OBSERVABILITY_ENABLED` / `THREADLINE_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `THREADLINE_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
/// - `THREADLINE_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stdout in a compact console format.
/// - `RUST_LOG`: optional filter override.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        if let Ok(path_raw) = std::env::var("THREADLINE_JSON_LOG_PATH") {
            let (dir, file_name) = log_target(Path::new(&path_raw));
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_target_splits_nested_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("run.jsonl");
        let (dir, file) = log_target(&path);
        assert_eq!(dir, tmp.path().join("logs"));
        assert_eq!(file, "run.jsonl");
    }

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        let (dir, file) = log_target(Path::new("out.jsonl"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(file, "out.jsonl");
    }

    #[test]
    fn init_is_idempotent() {
        init_observability();
        init_observability();
    }
}
