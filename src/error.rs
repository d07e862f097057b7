//! # Error Handling
//!
//! Errors are structured for programmatic inspection: every variant carries the
//! operation context that produced it, and [`DetectError::code`] collapses the
//! hierarchy into the flat [`ResultCode`] taxonomy exposed at the API boundary.
//!
//! ## Classification
//!
//! - `Argument`: invalid or empty input, rejected before any side effect
//! - `Io`: transport failure while reading or writing a file
//! - `Contents`: a file was readable but its format or integrity is wrong
//!   (bad magic, malformed node stream); detected before any embedded size is
//!   trusted
//! - `Memory`: an allocation or a fixed-capacity region could not accommodate
//!   the request; the target is left in its prior (or empty) state
//! - `Capacity`: the classifier exceeds the per-core device budget; detected
//!   before any upload

use std::collections::TryReserveError;
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

/// Flat result code reported at the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// No error occurred.
    Success,
    /// One of the arguments provided to a function is invalid.
    Argument,
    /// File operation error (open, read, write or close).
    File,
    /// Data read from a file does not meet the required format.
    FileContents,
    /// Not enough memory to perform the operation.
    Memory,
    /// Other error (capacity violation on the device).
    Other,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Argument => "argument",
            ResultCode::File => "file",
            ResultCode::FileContents => "file-contents",
            ResultCode::Memory => "memory",
            ResultCode::Other => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for every fallible operation in this crate.
#[derive(Debug)]
pub enum DetectError {
    /// Invalid input, rejected before any mutation.
    Argument { what: String, reason: String },
    /// I/O failure, with the operation and the path involved when known.
    Io {
        operation: String,
        path: Option<PathBuf>,
        source: std::io::Error,
    },
    /// File or buffer contents violate the expected format.
    Contents {
        path: Option<PathBuf>,
        reason: String,
    },
    /// Allocation failure or exhaustion of a fixed-capacity region.
    Memory {
        resource: String,
        source: Option<TryReserveError>,
    },
    /// A hard device ceiling was exceeded (classifier larger than a core can
    /// hold).
    Capacity {
        what: String,
        size: usize,
        limit: usize,
    },
}

impl DetectError {
    pub fn argument(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Argument {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: None,
            source,
        }
    }

    pub fn io_at(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation: operation.into(),
            path: Some(path.into()),
            source,
        }
    }

    pub fn contents(reason: impl Into<String>) -> Self {
        Self::Contents {
            path: None,
            reason: reason.into(),
        }
    }

    pub fn contents_at(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Contents {
            path: Some(path.into()),
            reason: reason.into(),
        }
    }

    pub fn memory(resource: impl Into<String>) -> Self {
        Self::Memory {
            resource: resource.into(),
            source: None,
        }
    }

    pub fn memory_from(resource: impl Into<String>, source: TryReserveError) -> Self {
        Self::Memory {
            resource: resource.into(),
            source: Some(source),
        }
    }

    pub fn capacity(what: impl Into<String>, size: usize, limit: usize) -> Self {
        Self::Capacity {
            what: what.into(),
            size,
            limit,
        }
    }

    /// Map to the flat code reported at the API boundary.
    pub fn code(&self) -> ResultCode {
        match self {
            DetectError::Argument { .. } => ResultCode::Argument,
            DetectError::Io { .. } => ResultCode::File,
            DetectError::Contents { .. } => ResultCode::FileContents,
            DetectError::Memory { .. } => ResultCode::Memory,
            DetectError::Capacity { .. } => ResultCode::Other,
        }
    }
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::Argument { what, reason } => {
                write!(f, "invalid argument `{what}`: {reason}")
            }
            DetectError::Io {
                operation,
                path,
                source,
            } => match path {
                Some(p) => write!(f, "{operation} failed for {}: {source}", p.display()),
                None => write!(f, "{operation} failed: {source}"),
            },
            DetectError::Contents { path, reason } => match path {
                Some(p) => write!(f, "bad contents in {}: {reason}", p.display()),
                None => write!(f, "bad contents: {reason}"),
            },
            DetectError::Memory { resource, .. } => {
                write!(f, "out of memory while allocating {resource}")
            }
            DetectError::Capacity { what, size, limit } => {
                write!(f, "{what} is {size} bytes, device limit is {limit}")
            }
        }
    }
}

impl StdError for DetectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DetectError::Io { source, .. } => Some(source),
            DetectError::Memory {
                source: Some(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type DetectResult<T> = Result<T, DetectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            DetectError::argument("image", "empty").code(),
            ResultCode::Argument
        );
        assert_eq!(
            DetectError::io("read", std::io::Error::new(std::io::ErrorKind::Other, "boom")).code(),
            ResultCode::File
        );
        assert_eq!(
            DetectError::contents("bad magic").code(),
            ResultCode::FileContents
        );
        assert_eq!(DetectError::memory("arena").code(), ResultCode::Memory);
        assert_eq!(
            DetectError::capacity("classifier", 8000, 7680).code(),
            ResultCode::Other
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = DetectError::contents_at("/tmp/c.dat", "unknown node id");
        let text = err.to_string();
        assert!(text.contains("/tmp/c.dat"));
        assert!(text.contains("unknown node id"));
    }
}
