//! Log sink for device-originated and client-originated log lines.
//!
//! The server reports log lines with Python-style numeric levels. The default
//! [`TracingSink`] re-emits them as `tracing` events under the
//! `dexhand::device` target so applications control formatting and filtering
//! through their own subscriber.

/// Log level used by the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Suppressed.
    NotSet,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Critical.
    Critical,
}

impl LogLevel {
    /// Parses a numeric wire level.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotSet),
            10 => Some(Self::Debug),
            20 => Some(Self::Info),
            30 => Some(Self::Warning),
            40 => Some(Self::Error),
            50 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Returns the numeric wire level.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NotSet => 0,
            Self::Debug => 10,
            Self::Info => 20,
            Self::Warning => 30,
            Self::Error => 40,
            Self::Critical => 50,
        }
    }
}

/// Destination for log lines.
pub trait LogSink: Send + Sync {
    /// Logs one line. `from_device` is true for lines the server sent.
    fn log(&self, level: LogLevel, message: &str, from_device: bool);

    /// Logs a line whose wire level could not be parsed.
    fn log_code(&self, code: u8, message: &str, from_device: bool) {
        match LogLevel::from_code(code) {
            Some(level) => self.log(level, message, from_device),
            None => self.log(
                LogLevel::Error,
                &format!("invalid log level {code} for message: {message}"),
                from_device,
            ),
        }
    }
}

/// Sink that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    ignore_own_info: bool,
}

impl TracingSink {
    /// Creates a sink.
    ///
    /// When `ignore_own_info` is set, client-originated info lines are
    /// demoted to debug.
    #[must_use]
    pub const fn new(ignore_own_info: bool) -> Self {
        Self { ignore_own_info }
    }
}

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str, from_device: bool) {
        let level = if !from_device && self.ignore_own_info && level == LogLevel::Info {
            LogLevel::Debug
        } else {
            level
        };

        match level {
            LogLevel::NotSet => {}
            LogLevel::Debug => tracing::debug!(target: "dexhand::device", from_device, "{message}"),
            LogLevel::Info => tracing::info!(target: "dexhand::device", from_device, "{message}"),
            LogLevel::Warning => tracing::warn!(target: "dexhand::device", from_device, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(target: "dexhand::device", from_device, "{message}");
            }
        }
    }
}
