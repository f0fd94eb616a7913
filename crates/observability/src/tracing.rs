//! Tracing/logging initialization.
//!
//! Filters come from `RUST_LOG` (falling back to the configured default
//! directive). Output is JSON unless `EVENTLANE_LOG_FORMAT=compact`.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" | "text" => Some(Self::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    test_writer: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
            test_writer: false,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(format) = lookup("EVENTLANE_LOG_FORMAT").as_deref().and_then(LogFormat::parse) {
            settings.format = format;
        }
        if let Some(directive) = lookup("EVENTLANE_LOG_DEFAULT").filter(|d| !d.trim().is_empty()) {
            settings.default_directive = directive;
        }
        settings
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub(crate) fn for_tests(mut self) -> Self {
        self.test_writer = true;
        self
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.default_directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let _ = match (settings.format, settings.test_writer) {
        (LogFormat::Json, false) => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        (LogFormat::Json, true) => builder.json().with_test_writer().try_init(),
        (LogFormat::Compact, false) => builder.compact().try_init(),
        (LogFormat::Compact, true) => builder.compact().with_test_writer().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_read_from_lookup() {
        let settings = LogSettings::from_lookup(|key| match key {
            "EVENTLANE_LOG_FORMAT" => Some("Compact".to_string()),
            "EVENTLANE_LOG_DEFAULT" => Some("eventlane_infra=debug".to_string()),
            _ => None,
        });
        assert_eq!(settings.format, LogFormat::Compact);
        assert_eq!(settings.default_directive, "eventlane_infra=debug");
    }

    #[test]
    fn unknown_format_keeps_json() {
        let settings = LogSettings::from_lookup(|key| (key == "EVENTLANE_LOG_FORMAT").then(|| "yaml".to_string()));
        assert_eq!(settings, LogSettings::default());
    }

    #[test]
    fn init_twice_is_a_no_op() {
        let settings = LogSettings::default().with_default_directive("warn").for_tests();
        init(&settings);
        init(&settings);
        ::tracing::info!("still logging");
    }
}
