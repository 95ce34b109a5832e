//! Error taxonomy of the crate.

use std::fmt::Display;
use std::io;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by image operations.
///
/// `WrongFormat` is expected during probing and is not fatal to callers:
/// it means the bytes are not an image of the attempted format, and
/// probing may fall through to the next container type.  All other kinds
/// describe an image of the right format that cannot (or can only
/// partially) be served.
#[derive(Debug, Error)]
pub enum Error {
    /// The data is not an image of the attempted format.
    #[error("wrong image format: {0}")]
    WrongFormat(String),

    /// The image violates a structural invariant of its format.
    #[error("malformed image: {0}")]
    Malformed(String),

    /// The image is well-formed but uses a feature outside the supported
    /// subset.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The image is encrypted.
    #[error("unsupported encryption method: {0}")]
    UnsupportedEncryption(String),

    /// The image uses a compression type with no registered decompressor.
    #[error("unsupported compression type: {0}")]
    UnsupportedCompression(String),

    /// The image's backing file could not be resolved or opened.
    #[error("unsupported backing file: {0}")]
    UnsupportedBackingFile(String),

    /// An underlying read or write failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this is the [`Error::WrongFormat`] probing sentinel.
    pub fn is_wrong_format(&self) -> bool {
        matches!(self, Error::WrongFormat(_))
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::WrongFormat(s) => Error::WrongFormat(s.clone()),
            Error::Malformed(s) => Error::Malformed(s.clone()),
            Error::UnsupportedFeature(s) => Error::UnsupportedFeature(s.clone()),
            Error::UnsupportedEncryption(s) => Error::UnsupportedEncryption(s.clone()),
            Error::UnsupportedCompression(s) => Error::UnsupportedCompression(s.clone()),
            Error::UnsupportedBackingFile(s) => Error::UnsupportedBackingFile(s.clone()),
            // io::Error is not Clone; keep the kind and the rendered message.
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl Error {
    /// Prefix the error's message with `context`, keeping its kind.
    pub(crate) fn context<C: Display>(self, context: C) -> Self {
        match self {
            Error::WrongFormat(s) => Error::WrongFormat(format!("{context}: {s}")),
            Error::Malformed(s) => Error::Malformed(format!("{context}: {s}")),
            Error::UnsupportedFeature(s) => Error::UnsupportedFeature(format!("{context}: {s}")),
            Error::UnsupportedEncryption(s) => {
                Error::UnsupportedEncryption(format!("{context}: {s}"))
            }
            Error::UnsupportedCompression(s) => {
                Error::UnsupportedCompression(format!("{context}: {s}"))
            }
            Error::UnsupportedBackingFile(s) => {
                Error::UnsupportedBackingFile(format!("{context}: {s}"))
            }
            Error::Io(e) => {
                // The io kind survives; only the message grows.
                let kind = e.kind();
                Error::Io(io::Error::new(kind, format!("{context}: {e}")))
            }
        }
    }
}

/// Attach context to the error arm of crate results.
pub(crate) trait Context {
    /// Prefix a contained error with the description produced by
    /// `describe`; `Ok` values pass through untouched.
    fn context_with<C: Display, F: FnOnce() -> C>(self, describe: F) -> Self;
}

impl<T> Context for Result<T> {
    fn context_with<C: Display, F: FnOnce() -> C>(self, describe: F) -> Self {
        match self {
            Err(err) => Err(err.context(describe())),
            ok => ok,
        }
    }
}
