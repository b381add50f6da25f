//! Logging setup shared by the server binary and the test suite.

use colored::Color::{Green, Red, Yellow};
use logforth::append::{Stderr, Stdout};
use logforth::diagnostic::ThreadLocalDiagnostic;
use logforth::layout::TextLayout;
use std::sync::Once;

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default)]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter (e.g. "info", "debug", "info,slotserve=debug"); the
    /// RUST_LOG environment variable takes precedence when set.
    pub level: String,
    pub output: LogOutput,
    /// Color info/warn/error lines green/yellow/red.
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            colored: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn stdout(mut self) -> Self {
        self.output = LogOutput::Stdout;
        self
    }

    pub fn no_color(mut self) -> Self {
        self.colored = false;
        self
    }
}

/// HTTP-stack modules quieted to warn unless the filter names them.
const DEFAULT_NOISY_MODULE_LEVELS: [(&str, &str); 5] = [
    ("h2", "warn"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("axum", "warn"),
    ("tower", "warn"),
];

fn apply_default_module_levels(mut filter: String) -> String {
    for (module, level) in DEFAULT_NOISY_MODULE_LEVELS {
        if !filter.contains(&format!("{module}=")) {
            if !filter.is_empty() {
                filter.push(',');
            }
            filter.push_str(module);
            filter.push('=');
            filter.push_str(level);
        }
    }
    filter
}

/// Initialize logging; idempotent, later calls are no-ops.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        let LoggingConfig {
            level,
            output,
            colored,
        } = config;

        let filter_str =
            std::env::var("RUST_LOG").unwrap_or_else(|_| apply_default_module_levels(level));
        let filter = logforth::filter::env_filter::EnvFilterBuilder::from_env_or(
            "RUST_LOG", filter_str,
        )
        .build();

        let colored_layout = || {
            TextLayout::default()
                .info_color(Green)
                .warn_color(Yellow)
                .error_color(Red)
        };

        let builder = logforth::starter_log::builder();
        match (output, colored) {
            (LogOutput::Stdout, true) => builder
                .dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(Stdout::default().with_layout(colored_layout()))
                })
                .apply(),
            (LogOutput::Stdout, false) => builder
                .dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(Stdout::default())
                })
                .apply(),
            (LogOutput::Stderr, true) => builder
                .dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(Stderr::default().with_layout(colored_layout()))
                })
                .apply(),
            (LogOutput::Stderr, false) => builder
                .dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(Stderr::default())
                })
                .apply(),
        }
    });
}

/// Plain stderr logging for tests.
pub fn init_stderr(level: &str) {
    init(LoggingConfig::new(level).no_color());
}

/// Default server logging: stderr, colored, "info".
pub fn init_default() {
    init(LoggingConfig::default());
}
