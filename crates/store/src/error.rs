//! Error types for the data-space container.

use std::io;

use snafu::Snafu;

use crate::version::VersionPair;

/// Result type alias for container operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during container operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error outside of any specific container element.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A native storage call on a named element failed.
    #[snafu(display("I/O error on {path}: {source}"))]
    Native {
        /// Path of the element the call was made on.
        path: String,
        /// The status reported by the backend.
        source: io::Error,
    },

    /// The backend refused access to an element.
    #[snafu(display("Access denied: {path}"))]
    AccessDenied {
        /// Path of the element.
        path: String,
    },

    /// An element that must exist was not found.
    #[snafu(display("Element not found: {path}"))]
    NotFound {
        /// Path of the missing element.
        path: String,
    },

    /// Persisted container metadata is malformed.
    #[snafu(display("Corrupted container data: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// A persisted feature was written by an incompatible format version.
    #[snafu(display(
        "Wrong format version for {feature}: stored {stored}, this software supports {required}"
    ))]
    WrongFormatVersion {
        /// Feature identifier of the versioned record.
        feature: String,
        /// Version found on disk.
        stored: VersionPair,
        /// Version implemented by this software.
        required: VersionPair,
    },

    /// Caller supplied an invalid argument.
    #[snafu(display("Invalid argument: {reason}"))]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// A name reserved for internal bookkeeping was used.
    #[snafu(display("Name is reserved: {name:?}"))]
    ReservedName {
        /// The rejected name.
        name: String,
    },

    /// A transform or data-space label is already defined.
    #[snafu(display("Label already in use: {label}"))]
    LabelInUse {
        /// The conflicting label.
        label: String,
    },

    /// A storage was deleted non-recursively while it still had children.
    #[snafu(display("Storage is not empty: {name}"))]
    StorageNotEmpty {
        /// Name of the storage.
        name: String,
    },

    /// The object was used after it was disposed or its container closed.
    #[snafu(display("Cannot access a disposed {object}"))]
    Disposed {
        /// Kind of object that was disposed.
        object: &'static str,
    },

    /// A transform could not be brought to a ready state.
    #[snafu(display("Transform {label} is not ready"))]
    TransformNotReady {
        /// Label of the transform.
        label: String,
    },

    /// A transform failed while encoding or decoding data.
    #[snafu(display("Transform {label} failed: {reason}"))]
    Transform {
        /// Label of the transform.
        label: String,
        /// Description of the failure.
        reason: String,
    },

    /// Configuration failed validation.
    #[snafu(display("Invalid configuration: {message}"))]
    Config {
        /// Description of the invalid value.
        message: String,
    },

    /// The container was opened read-only.
    #[snafu(display("Container is read-only"))]
    ReadOnly,
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl Error {
    /// Maps a backend status for the element at `path` onto the error taxonomy.
    pub(crate) fn native(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Error::AccessDenied { path },
            io::ErrorKind::NotFound => Error::NotFound { path },
            _ => Error::Native { path, source },
        }
    }

    /// Converts into an `io::Error` for the `std::io` stream traits.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io { source } | Error::Native { source, .. } => source,
            Error::AccessDenied { .. } | Error::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, self.to_string())
            },
            Error::NotFound { .. } => io::Error::new(io::ErrorKind::NotFound, self.to_string()),
            Error::Corrupted { .. } | Error::WrongFormatVersion { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, self.to_string())
            },
            other => io::Error::other(other.to_string()),
        }
    }
}
