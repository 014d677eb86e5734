use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed stream line {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Malformed lines are skipped; read failures end the turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Malformed { .. })
    }
}
