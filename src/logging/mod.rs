//! Logging infrastructure - structured tracing across the marshaling engine
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level through `NATIVE_BRIDGE_LOG_*` variables
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console or daily-rotated file output, text or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Global logging state; holds the file writer guard when logging to a file
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path, daily rotated (console when unset)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
    /// Enable performance tracking
    pub track_performance: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: cfg!(debug_assertions),
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // NATIVE_BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("NATIVE_BRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        if let Ok(path) = std::env::var("NATIVE_BRIDGE_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("NATIVE_BRIDGE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("NATIVE_BRIDGE_LOG_SPANS").is_ok();

        if let Ok(val) = std::env::var("NATIVE_BRIDGE_LOG_PERF") {
            config.track_performance = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Minimal logging for hot invocation paths
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            log_path: None,
            json_format: false,
            show_spans: false,
            track_performance: false,
        }
    }

    /// Verbose logging into `native_bridge.log`
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: Some("native_bridge.log".to_string()),
            json_format: false,
            show_spans: true,
            track_performance: true,
        }
    }

    /// Builder: set log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Builder: log to a daily-rotated file
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Builder: emit JSON lines
    pub fn with_json(mut self, json: bool) -> Self {
        self.json_format = json;
        self
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber. If another subscriber is
/// already global (e.g. in tests), installation is skipped silently.
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "native_bridge={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let (layer, guard) = match &config.log_path {
            Some(path) => {
                let path = Path::new(path);
                let directory = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "native_bridge.log".into());
                let appender = tracing_appender::rolling::daily(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (build_layer(writer, &config, env_filter), Some(guard))
            }
            None => (build_layer(io::stdout, &config, env_filter), None),
        };

        let _ = tracing_subscriber::registry().with(layer).try_init();
        guard
    });
}

fn build_layer<W>(
    writer: W,
    config: &LogConfig,
    filter: EnvFilter,
) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.show_spans {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions))
            .with_filter(filter)
            .boxed()
    }
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Engine event helpers
// ============================================================================

/// Log native block allocation
#[inline]
pub fn log_allocation(size: usize, ptr: *const u8) {
    use tracing::trace;
    trace!(
        event = "allocation",
        size_bytes = size,
        address = ?ptr,
        "Native memory allocated"
    );
}

/// Log native block release
#[inline]
pub fn log_deallocation(size: usize, ptr: *const u8) {
    use tracing::trace;
    trace!(
        event = "deallocation",
        size_bytes = size,
        address = ?ptr,
        "Native memory released"
    );
}

/// Log a computed structure layout
pub fn log_layout_computed(name: &str, size: usize, alignment: usize, fields: usize) {
    use tracing::debug;
    debug!(
        event = "layout_computed",
        structure = name,
        size_bytes = size,
        alignment = alignment,
        fields = fields,
        "Structure layout computed"
    );
}

/// Log native function invocation
pub fn log_invoke(fn_name: &str, arg_count: usize) {
    use tracing::debug;
    debug!(
        event = "invoke",
        function = fn_name,
        args = arg_count,
        "Native function called"
    );
}

/// Log native function return
pub fn log_invoke_return(fn_name: &str) {
    use tracing::trace;
    trace!(
        event = "invoke_return",
        function = fn_name,
        "Native function returned"
    );
}

/// Log invocation failure
pub fn log_invoke_error(fn_name: &str, error: &str) {
    use tracing::error;
    error!(
        event = "invoke_error",
        function = fn_name,
        error = error,
        "Native invocation failed"
    );
}

/// Log trampoline creation
pub fn log_callback_created(identity: usize, address: usize, convention: &str, converting: bool) {
    use tracing::debug;
    debug!(
        event = "callback_created",
        identity = identity,
        trampoline = address,
        convention = convention,
        converting = converting,
        "Callback trampoline created"
    );
}

/// Log trampoline teardown
pub fn log_callback_released(identity: usize, address: usize) {
    use tracing::debug;
    debug!(
        event = "callback_released",
        identity = identity,
        trampoline = address,
        "Callback trampoline released"
    );
}

/// Log a trampoline invoked after its callback was dropped
pub fn log_callback_orphaned(address: usize) {
    use tracing::warn;
    warn!(
        event = "callback_orphaned",
        trampoline = address,
        "Native code invoked a callback that no longer exists; returning zero"
    );
}

/// Log a callback whose body failed
pub fn log_callback_error(address: usize, error: &str) {
    use tracing::error;
    error!(
        event = "callback_error",
        trampoline = address,
        error = error,
        "Callback failed; returning zero"
    );
}

/// Log a type conversion through a codec
pub fn log_codec_conversion(key: &str, direction: &str) {
    use tracing::trace;
    trace!(
        event = "codec_conversion",
        codec = key,
        direction = direction,
        "Codec conversion performed"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &str) -> PerformanceGuard {
        PerformanceGuard {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: String,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                operation = %self.operation,
                duration_us = elapsed.as_micros(),
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_path.is_none());

        let perf_config = LogConfig::performance();
        assert_eq!(perf_config.level, Level::ERROR);

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert_eq!(debug_config.log_path.as_deref(), Some("native_bridge.log"));
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::default()
            .with_level(Level::DEBUG)
            .with_file("logs/bridge.log")
            .with_json(true);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.log_path.as_deref(), Some("logs/bridge.log"));
        assert!(config.json_format);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        assert!(is_initialized());
    }
}
