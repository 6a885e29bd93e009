use std::fmt;
use std::ops::Deref;

use abscissa_core::error::{BoxError, Context};

/// Kinds of errors surfaced by Paywatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// Invalid or unusable configuration.
    Config,
    /// Database open, migration, or query failure.
    Database,
    /// The monitor could not be brought up.
    Init,
    /// A monitor task failed.
    Monitor,
    /// A chain node call failed.
    Rpc,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "configuration error"),
            ErrorKind::Database => write!(f, "database error"),
            ErrorKind::Init => write!(f, "initialization error"),
            ErrorKind::Monitor => write!(f, "monitor error"),
            ErrorKind::Rpc => write!(f, "chain RPC error"),
        }
    }
}

impl std::error::Error for ErrorKind {}

impl ErrorKind {
    /// Creates an error context from this error.
    pub(crate) fn context(self, source: impl Into<BoxError>) -> Context<ErrorKind> {
        Context::new(self, Some(source.into()))
    }
}

/// Error type
#[derive(Debug)]
pub(crate) struct Error(Box<Context<ErrorKind>>);

impl Deref for Error {
    type Target = Context<ErrorKind>;

    fn deref(&self) -> &Context<ErrorKind> {
        &self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Context::new(kind, None).into()
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(context: Context<ErrorKind>) -> Self {
        Error(Box::new(context))
    }
}
