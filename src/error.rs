//! Error types for the model server

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Outcome of a failed source load.
///
/// Cloneable so that one failed read can be delivered to every request
/// that was coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Source unreadable (missing file, bad gzip stream, not UTF-8).
    #[error("Source '{source_id}' could not be read: {message}")]
    Io { source_id: String, message: String },

    /// Source read fine but is not a well-formed document.
    #[error("Source '{source_id}' could not be parsed: {message}")]
    Parse { source_id: String, message: String },
}

impl LoadError {
    pub fn io(source_id: &str, err: &std::io::Error) -> Self {
        LoadError::Io {
            source_id: source_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse(source_id: &str, message: impl Into<String>) -> Self {
        LoadError::Parse {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            LoadError::Io { source_id, .. } | LoadError::Parse { source_id, .. } => source_id,
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, LoadError::Parse { .. })
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Flush error: {0}")]
    Flush(#[source] std::io::Error),

    #[error("Writer is sealed, no further categories can be written")]
    WriterSealed,

    #[error("No data block has been started")]
    NoDataBlock,

    #[error("Writer output requested before encode()")]
    NotEncoded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServerError {
    pub fn encode(message: impl Into<String>) -> Self {
        ServerError::Encode(message.into())
    }

    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Load(LoadError::Io { .. }) => "NOT_FOUND",
            ServerError::Load(LoadError::Parse { .. }) => "PARSE_ERROR",
            ServerError::Encode(_) => "ENCODE_ERROR",
            ServerError::Flush(_) => "FLUSH_ERROR",
            ServerError::WriterSealed => "WRITER_SEALED",
            ServerError::NoDataBlock => "NO_DATA_BLOCK",
            ServerError::NotEncoded => "NOT_ENCODED",
            ServerError::InvalidConfig(_) => "INVALID_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_load_error_codes() {
        let io: ServerError = LoadError::Io {
            source_id: "1cbs".to_string(),
            message: "missing".to_string(),
        }
        .into();
        let parse: ServerError = LoadError::parse("1cbs", "no data block").into();

        assert_eq!(io.code(), "NOT_FOUND");
        assert_eq!(parse.code(), "PARSE_ERROR");
    }

    #[test]
    fn test_encode_and_flush_are_distinct() {
        let encode = ServerError::encode("chain did not end in bytes");
        let flush = ServerError::Flush(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "closed",
        ));

        assert_eq!(encode.code(), "ENCODE_ERROR");
        assert_eq!(flush.code(), "FLUSH_ERROR");
        assert!(encode.to_string().contains("chain did not end in bytes"));
    }

    #[test]
    fn test_load_error_source_id() {
        let err = LoadError::io(
            "4hhb",
            &std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.source_id(), "4hhb");
        assert!(!err.is_parse());
        assert!(LoadError::parse("x", "bad").is_parse());
    }
}
