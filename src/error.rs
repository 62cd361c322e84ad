use std::fmt::Display;

/// General error type for any kind of error appearing during density estimation or clustering.
///
/// `message` carries a (hopefully) helpful message as to why the error occurred, `kind` contains an [`ErrorKind`]
/// with the specific error type.
#[derive(Debug)]
pub struct MsError {
    pub message: String,
    pub kind: ErrorKind,
}

impl MsError {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        return Self {
            message: message.into(),
            kind,
        };
    }
}

impl Display for MsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MsError {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rank, length or element kind mismatch between an input array and the expected contract
    ShapeError,
    /// Kernel, spatial or balls name not present in the registry
    UnknownName,
    /// Kernel parameter string rejected during configuration
    ConfigError,
    /// Scalar argument out of its valid range
    ParameterError,
    /// Operation requires prior setup that has not happened
    StateError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ShapeError => write!(f, "ShapeError"),
            ErrorKind::UnknownName => write!(f, "UnknownName"),
            ErrorKind::ConfigError => write!(f, "ConfigError"),
            ErrorKind::ParameterError => write!(f, "ParameterError"),
            ErrorKind::StateError => write!(f, "StateError"),
        }
    }
}
