//! The error taxonomy returned by every fallible operation in this crate.

use std::io;

/// The result type returned by all public operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a [`crate::Engine`] operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No live record exists for the requested key.
    #[error("key not found")]
    KeyNotFound,

    /// `Put` was given a key longer than `Config::max_key_size`.
    #[error("key of {len} bytes exceeds the configured max key size of {max} bytes")]
    KeyTooLarge {
        /// Length of the rejected key, in bytes.
        len: usize,
        /// The configured limit that was exceeded.
        max: usize,
    },

    /// `Put` was given a value longer than `Config::max_value_size`.
    #[error("value of {len} bytes exceeds the configured max value size of {max} bytes")]
    ValueTooLarge {
        /// Length of the rejected value, in bytes.
        len: usize,
        /// The configured limit that was exceeded.
        max: usize,
    },

    /// Another live engine instance already holds the directory's lock file.
    #[error("the database directory is locked by another instance")]
    DatabaseLocked,

    /// A checksum mismatch or an impossible record was found in the interior
    /// of a datafile, i.e. not at a clean trailing position.
    #[error("corrupt record in {path}: {reason}")]
    Corrupt {
        /// The datafile in which corruption was detected.
        path: std::path::PathBuf,
        /// A short description of what failed to validate.
        reason: String,
    },

    /// The engine has already been closed.
    #[error("operation attempted on a closed engine")]
    Closed,

    /// A wrapped operating system error (open/read/write/sync/rename/unlink).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<std::path::PathBuf>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
