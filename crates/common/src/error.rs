//! Error types for meshplane

use thiserror::Error;

/// Result type alias using meshplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// Abstract error category surfaced to callers.
///
/// The transport layer maps these onto its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    AlreadyExists,
    PermissionDenied,
    UserNotPartOfAccount,
    GroupLinked,
    StoreFailure,
    Multiple,
    Internal,
}

/// meshplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("user is not part of the account")]
    UserNotPartOfAccount,

    #[error("group has been linked to {resource}: {name}")]
    GroupLinked { resource: String, name: String },

    #[error("{}", join_messages(.0))]
    Joined(Vec<Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn group_linked(resource: &str, name: impl Into<String>) -> Self {
        Error::GroupLinked {
            resource: resource.to_string(),
            name: name.into(),
        }
    }

    /// Error returned to non-admin users attempting a privileged operation.
    pub fn admin_permission() -> Self {
        Error::PermissionDenied("admin role permission required to perform this action".to_string())
    }

    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, `Joined` otherwise.
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Joined(errors)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Database(_) | Error::Serialization(_) => ErrorKind::StoreFailure,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::UserNotPartOfAccount => ErrorKind::UserNotPartOfAccount,
            Error::GroupLinked { .. } => ErrorKind::GroupLinked,
            Error::Joined(_) => ErrorKind::Multiple,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Flattened view over this error and any joined children.
    pub fn errors(&self) -> Vec<&Error> {
        match self {
            Error::Joined(errors) => errors.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
