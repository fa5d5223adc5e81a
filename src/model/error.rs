use thiserror::Error;

/// Boxed cause carried by every backend-originated error.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by every driver operation.
///
/// Recovery logic should match on [`StorageError::kind`], never on the
/// rendered message.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file not found: {location}")]
    FileNotFound {
        location: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("missing permission for: {location}")]
    PermissionMissing {
        location: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("authorization required for: {location}")]
    AuthorizationRequired {
        location: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("no such bucket while accessing: {location}")]
    NoSuchBucket {
        location: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("wrong key path: {location}")]
    WrongKeyPath {
        location: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("invalid input for {location}: {message}")]
    InvalidInput { location: String, message: String },

    #[error("method `{method}` is not supported by the `{driver}` driver")]
    MethodNotSupported {
        method: &'static str,
        driver: &'static str,
    },

    #[error("unknown error [{code}] at: {location}")]
    UnknownException {
        code: String,
        location: String,
        #[source]
        source: Option<Cause>,
    },
}

/// Fieldless view of a [`StorageError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FileNotFound,
    PermissionMissing,
    AuthorizationRequired,
    NoSuchBucket,
    WrongKeyPath,
    InvalidInput,
    MethodNotSupported,
    UnknownException,
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::PermissionMissing { .. } => ErrorKind::PermissionMissing,
            Self::AuthorizationRequired { .. } => ErrorKind::AuthorizationRequired,
            Self::NoSuchBucket { .. } => ErrorKind::NoSuchBucket,
            Self::WrongKeyPath { .. } => ErrorKind::WrongKeyPath,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::MethodNotSupported { .. } => ErrorKind::MethodNotSupported,
            Self::UnknownException { .. } => ErrorKind::UnknownException,
        }
    }

    /// Location the failing operation was acting on, if any.
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::FileNotFound { location, .. }
            | Self::PermissionMissing { location, .. }
            | Self::AuthorizationRequired { location, .. }
            | Self::NoSuchBucket { location, .. }
            | Self::WrongKeyPath { location, .. }
            | Self::InvalidInput { location, .. }
            | Self::UnknownException { location, .. } => Some(location),
            Self::MethodNotSupported { .. } => None,
        }
    }

    /// Native error code, only kept by the catch-all kind.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::UnknownException { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::FileNotFound
    }

    pub fn invalid_input(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn not_supported(method: &'static str, driver: &'static str) -> Self {
        Self::MethodNotSupported { method, driver }
    }

    /// Builds an error of the given kind around a backend cause.
    ///
    /// `InvalidInput` and `MethodNotSupported` are never produced by a
    /// backend, so asking for them here yields `UnknownException`.
    pub fn from_kind(kind: ErrorKind, location: &str, code: String, source: Option<Cause>) -> Self {
        let location = location.to_string();
        match kind {
            ErrorKind::FileNotFound => Self::FileNotFound { location, source },
            ErrorKind::PermissionMissing => Self::PermissionMissing { location, source },
            ErrorKind::AuthorizationRequired => Self::AuthorizationRequired { location, source },
            ErrorKind::NoSuchBucket => Self::NoSuchBucket { location, source },
            ErrorKind::WrongKeyPath => Self::WrongKeyPath { location, source },
            ErrorKind::InvalidInput
            | ErrorKind::MethodNotSupported
            | ErrorKind::UnknownException => Self::UnknownException {
                code,
                location,
                source,
            },
        }
    }
}

/// A failure reported by a native backend client, before translation.
///
/// `code` is the backend's own error code (S3 / Azure error code string,
/// GCS HTTP status, local `io::ErrorKind` name), `status` the HTTP status
/// when there is one.
#[derive(Error, Debug)]
#[error("[{code}] {source}")]
pub struct NativeError {
    pub code: String,
    pub status: Option<u16>,
    #[source]
    pub source: Cause,
}

impl NativeError {
    pub fn new(code: impl Into<String>, status: Option<u16>, source: impl Into<Cause>) -> Self {
        Self {
            code: code.into(),
            status,
            source: source.into(),
        }
    }

    /// Status-only fallback shared by the HTTP backends.
    pub fn kind_from_status(&self) -> ErrorKind {
        match self.status {
            Some(404) => ErrorKind::FileNotFound,
            Some(403) => ErrorKind::PermissionMissing,
            Some(401) => ErrorKind::AuthorizationRequired,
            _ => ErrorKind::UnknownException,
        }
    }
}
