use thiserror::Error;

pub type Result<T> = std::result::Result<T, HavenError>;

#[derive(Debug, Error)]
pub enum HavenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file record not found: '{0}'")]
    FileNotFound(String),

    #[error("directory record not found: '{0}'")]
    DirNotFound(String),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("invalid vault path: {0}")]
    InvalidPath(String),

    #[error("cannot take the parent of the root directory")]
    RootHasNoParent,

    #[error("invalid bubble status for '{0}'")]
    InvalidBubbleStatus(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("state persistence error: {0}")]
    State(String),

    #[error("store contract violation: {0}")]
    ContractViolation(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<HavenError>,
    },

    #[error("{0}")]
    Other(String),
}

impl HavenError {
    /// Wrap the error with a caller-side context line, preserving the
    /// original error as the source so callers can still match on it.
    pub fn context(self, context: impl Into<String>) -> Self {
        HavenError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any context layers.
    pub fn root_cause(&self) -> &HavenError {
        match self {
            HavenError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
