//! Error types shared by the bridge crates.
//!
//! Every failure is tagged with an [`ErrorCategory`] so callers can decide
//! whether to skip a cycle, fall back to another parsing strategy, reject a
//! command, or abort startup.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fetch, write or bus failure. Recovered on the next cycle.
    Transport,
    /// Markup or stream could not be interpreted.
    Parse,
    /// An inbound command payload could not be mapped to a device value.
    Translation,
    /// Startup configuration is unusable.
    Configuration,
    /// Illegal lifecycle transition.
    Lifecycle,
}

/// Bridge error types.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP fetch against the device failed.
    #[error("Fetch failed for '{path}': {reason}")]
    Fetch { path: String, reason: String },

    /// Device write request failed.
    #[error("Write failed for '{write_id}': {reason}")]
    Write { write_id: String, reason: String },

    /// Message bus operation failed.
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Markup or stream parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Command payload could not be translated.
    #[error("Cannot translate payload '{payload}' for {object_id}: {reason}")]
    Translation {
        object_id: String,
        payload: String,
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lifecycle transition not allowed.
    #[error("Invalid lifecycle transition: {from} -> {to}")]
    Lifecycle { from: String, to: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch { .. } | Self::Write { .. } | Self::Bus(_) => ErrorCategory::Transport,
            Self::Parse(_) | Self::Serialization(_) => ErrorCategory::Parse,
            Self::Translation { .. } => ErrorCategory::Translation,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Lifecycle { .. } => ErrorCategory::Lifecycle,
        }
    }

    /// Whether the process should stop because of this error.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Shorthand for a fetch failure.
    pub fn fetch(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Fetch {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a write failure.
    pub fn write(write_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Write {
            write_id: write_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a translation failure.
    pub fn translation(
        object_id: impl Into<String>,
        payload: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Translation {
            object_id: object_id.into(),
            payload: payload.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Configuration(format!("Invalid TOML: {}", e))
    }
}
