//! Shared error type for the project file system agent.

use thiserror::Error;

/// Result type used throughout `agent-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by `agent-core` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error with context describing what operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// YAML parsing failed.
    #[error("{context}: {message}")]
    Parse {
        /// What was being parsed.
        context: String,
        /// Parser error message.
        message: String,
    },

    /// JSON serialization failed.
    #[error("{context}: {source}")]
    Json {
        /// What was being serialized or parsed.
        context: String,
        /// The underlying serde_json error.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Creates an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a parse error.
    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a JSON error with context.
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display_includes_context() {
        let err = Error::io(
            "reading config.yml",
            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("reading config.yml"));
        assert!(msg.contains("not found"));
    }

    #[test]
    fn parse_error_display() {
        let err = Error::parse("parsing config.yml", "invalid mapping");
        assert!(err.to_string().contains("invalid mapping"));
    }
}
