//! Error types for a sandbox run.

use std::path::PathBuf;
use std::time::Duration;

/// Terminal failure of a sandbox run.
///
/// Transport failures of individual requests never appear here: they are
/// delivered to the sandboxed script through its request error handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The script path is missing or could not be read.
    #[error("script not found: {}", path.display())]
    MissingInput {
        /// Path that was requested.
        path: PathBuf,
        /// Underlying I/O error, when the file exists but could not be read.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The synthetic global graph could not be built.
    #[error("failed to build host environment: {0}")]
    Environment(String),

    /// The script threw while it was first evaluated.
    #[error("script injection failed: {message}")]
    Injection {
        /// Rendered exception.
        message: String,
        /// Stack trace reported by the engine, if any.
        trace: Option<String>,
    },

    /// The completion accessor never produced an identifier in time.
    #[error("no device id after {}ms", timeout.as_millis())]
    Timeout {
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// An uncaught exception outside the injection call, or a host panic.
    #[error("fatal: {message}")]
    Fatal {
        /// Rendered exception or panic payload.
        message: String,
        /// Stack trace reported by the engine, if any.
        trace: Option<String>,
    },
}

impl Error {
    /// Process exit status for this failure.
    ///
    /// Timeouts exit with `2`; everything else exits with `1`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Timeout { .. } => 2,
            Self::MissingInput { .. }
            | Self::Environment(_)
            | Self::Injection { .. }
            | Self::Fatal { .. } => 1,
        }
    }

    /// Stack trace attached to the failure, if the engine produced one.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Injection { trace, .. } | Self::Fatal { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }
}

impl From<boa_engine::JsError> for Error {
    fn from(err: boa_engine::JsError) -> Self {
        Self::Environment(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let missing = Error::MissingInput {
            path: PathBuf::from("nope.js"),
            source: None,
        };
        assert_eq!(missing.exit_code(), 1);

        let injection = Error::Injection {
            message: "boom".into(),
            trace: Some("at <main>".into()),
        };
        assert_eq!(injection.exit_code(), 1);
        assert_eq!(injection.trace(), Some("at <main>"));

        let timeout = Error::Timeout {
            timeout: Duration::from_millis(15_000),
        };
        assert_eq!(timeout.exit_code(), 2);
        assert_eq!(timeout.to_string(), "no device id after 15000ms");
        assert_eq!(timeout.trace(), None);
    }
}
