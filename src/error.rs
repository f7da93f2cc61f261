//! Error taxonomy for the object-store file system core.
//!
//! Every failure that crosses a component boundary (transport, staging file,
//! cache) is reduced to one of the kinds below. The kind, not the message,
//! drives retry and errno-mapping decisions — see [`FsError::is_retryable`]
//! and [`FsError::errno`].

use thiserror::Error;

/// The closed set of failure kinds the core distinguishes.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("access denied for {key}")]
    AccessDenied { key: String },

    #[error("precondition failed for {key}: {detail}")]
    PreconditionFailed { key: String, detail: String },

    #[error("request throttled: {detail}")]
    Throttled { detail: String },

    #[error("transient server error: {detail}")]
    ServerTransient { detail: String },

    #[error("client error: {detail}")]
    ClientFatal { detail: String },

    #[error("local I/O error on {path}: {source}")]
    LocalIO {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity check failed for {key}: {detail}")]
    Integrity { key: String, detail: String },
}

impl FsError {
    pub fn not_found(key: impl Into<String>) -> Self {
        FsError::NotFound { key: key.into() }
    }

    pub fn access_denied(key: impl Into<String>) -> Self {
        FsError::AccessDenied { key: key.into() }
    }

    pub fn precondition_failed(key: impl Into<String>, detail: impl Into<String>) -> Self {
        FsError::PreconditionFailed {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn throttled(detail: impl Into<String>) -> Self {
        FsError::Throttled {
            detail: detail.into(),
        }
    }

    pub fn server_transient(detail: impl Into<String>) -> Self {
        FsError::ServerTransient {
            detail: detail.into(),
        }
    }

    pub fn client_fatal(detail: impl Into<String>) -> Self {
        FsError::ClientFatal {
            detail: detail.into(),
        }
    }

    pub fn local_io(path: impl Into<String>, source: std::io::Error) -> Self {
        FsError::LocalIO {
            path: path.into(),
            source,
        }
    }

    pub fn integrity(key: impl Into<String>, detail: impl Into<String>) -> Self {
        FsError::Integrity {
            key: key.into(),
            detail: detail.into(),
        }
    }

    /// Propagation policy: only `ServerTransient` and `Throttled` are
    /// worth retrying. Everything else is either permanent or already the
    /// result of exhausting retries upstream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::ServerTransient { .. } | FsError::Throttled { .. })
    }

    /// Maps a kind to the errno the FUSE adapter surfaces to the kernel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound { .. } => libc::ENOENT,
            FsError::AccessDenied { .. } => libc::EACCES,
            FsError::PreconditionFailed { .. } => libc::EIO,
            FsError::Throttled { .. } => libc::EIO,
            FsError::ServerTransient { .. } => libc::EIO,
            FsError::ClientFatal { .. } => libc::EINVAL,
            FsError::LocalIO { .. } => libc::EIO,
            FsError::Integrity { .. } => libc::EIO,
        }
    }

    /// Classifies an HTTP status code. `detail` is attached verbatim
    /// for logging; callers that know the key should prefer the specific
    /// constructors above.
    pub fn from_status(status: u16, key: &str, detail: impl Into<String>) -> Self {
        match status {
            404 => FsError::not_found(key),
            403 | 401 => FsError::access_denied(key),
            412 => FsError::precondition_failed(key, detail),
            429 => FsError::throttled(detail),
            500..=599 => FsError::server_transient(detail),
            _ => FsError::client_fatal(detail),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
