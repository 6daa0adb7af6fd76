//! Top-level error types for Perles.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error classification used by the MCP boundary when rendering
/// tool-call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Validation,
    PreconditionFailed,
    ResourceExhausted,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fabric(e) => e.kind(),
            Error::Process(e) => e.kind(),
            Error::Validation(_) => ErrorKind::Validation,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) | Error::Persist(_) | Error::Io(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid port range {start}..={end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fabric graph and repository errors.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("thread {id} not found")]
    ThreadNotFound { id: String },

    #[error("channel #{slug} not found")]
    ChannelNotFound { slug: String },

    #[error("channel slug #{slug} already exists")]
    SlugExists { slug: String },

    #[error("thread {id} is not a channel")]
    NotAChannel { id: String },

    #[error("thread {id} is not a message")]
    NotAMessage { id: String },

    #[error("a channel requires a slug")]
    MissingSlug,

    #[error("only channels may carry a slug")]
    UnexpectedSlug,

    #[error("participant {agent_id} already joined")]
    ParticipantExists { agent_id: String },

    #[error("message {id} has no containing channel")]
    OrphanMessage { id: String },
}

impl FabricError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::ThreadNotFound { .. }
            | FabricError::ChannelNotFound { .. }
            | FabricError::OrphanMessage { .. } => ErrorKind::NotFound,
            FabricError::SlugExists { .. } | FabricError::ParticipantExists { .. } => {
                ErrorKind::AlreadyExists
            }
            FabricError::NotAChannel { .. }
            | FabricError::NotAMessage { .. }
            | FabricError::MissingSlug
            | FabricError::UnexpectedSlug => ErrorKind::Validation,
        }
    }
}

/// Process lifecycle and state-machine errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {id} not found")]
    NotFound { id: String },

    #[error("process {id} already exists")]
    AlreadyExists { id: String },

    #[error("precondition failed for {process}: {field} {reason}")]
    Precondition {
        process: String,
        field: &'static str,
        reason: String,
    },

    #[error("no free ports in range {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("failed to spawn process {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("command queue closed")]
    QueueClosed,
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NotFound { .. } => ErrorKind::NotFound,
            ProcessError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ProcessError::Precondition { .. } => ErrorKind::PreconditionFailed,
            ProcessError::PortsExhausted { .. } => ErrorKind::ResourceExhausted,
            ProcessError::SpawnFailed { .. } | ProcessError::QueueClosed => ErrorKind::Internal,
        }
    }
}

/// Input validation errors at the MCP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid task id '{value}': expected <prefix>-<id> (e.g. bd-42)")]
    TaskIdFormat { value: String },

    #[error("'{value}' contains path separators or traversal segments")]
    PathTraversal { value: String },

    #[error("summary too short: {len} chars (minimum {min})")]
    SummaryTooShort { len: usize, min: usize },

    #[error("invalid verdict '{value}': expected APPROVED or DENIED")]
    InvalidVerdict { value: String },

    #[error("missing required field '{name}'")]
    MissingField { name: &'static str },

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Persistence errors (event log, session index).
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to open event log at {path}: {reason}")]
    OpenLog { path: String, reason: String },

    #[error("failed to read session index at {path}: {reason}")]
    ReadIndex { path: String, reason: String },

    #[error("failed to write session index at {path}: {reason}")]
    WriteIndex { path: String, reason: String },

    #[error("session {id} not found")]
    SessionNotFound { id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_classification() {
        let e: Error = FabricError::ThreadNotFound { id: "t1".into() }.into();
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let e: Error = FabricError::SlugExists { slug: "tasks".into() }.into();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);

        let e: Error = ProcessError::Precondition {
            process: "WORKER.1".into(),
            field: "phase",
            reason: "expected Idle".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::PreconditionFailed);

        let e: Error = ProcessError::PortsExhausted {
            start: 9000,
            end: 9001,
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);

        let e: Error = ValidationError::TaskIdFormat {
            value: "../etc/passwd".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Validation);
    }

    #[test]
    fn messages_are_human_readable() {
        let e = ValidationError::SummaryTooShort { len: 5, min: 20 };
        assert_eq!(e.to_string(), "summary too short: 5 chars (minimum 20)");
    }
}
