use std::{convert::Infallible, fmt::Display};

use crate::op::{OpAttr, OpKind};
use crate::EngineKind;

/// Caller-facing status codes. Every [`Error`] maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidArguments,
    InvalidGraph,
    InvalidShape,
    Unimplemented,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("op kind {kind:?} is not supported by the compiler backend")]
    UnsupportedOp { kind: OpKind },

    #[error("attribute `{}` of op {op} has an unsupported value kind", attr.as_str())]
    UnsupportedAttr { op: usize, attr: OpAttr },

    #[error("op {op} is missing required attribute `{}`", attr.as_str())]
    MissingAttr { op: usize, attr: OpAttr },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("shape inference failed for op {op_id} ({kind:?}): {reason}")]
    ShapeInference {
        op_id: usize,
        kind: OpKind,
        reason: String,
    },

    #[error("compilation is only supported on cpu engines, got {kind:?}")]
    DeviceUnsupported { kind: EngineKind },

    /// Any failure downstream of translation. The cause is kept for diagnostics only.
    #[error("unimplemented: {cause}")]
    Unimplemented { cause: Box<Self> },

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// Arbitrary errors wrapping with context.
    #[error("{wrapped:?}\n{context:?}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::Wrapped`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// Collapse an error into the generic compilation failure.
    pub fn unimplemented(cause: Self) -> Self {
        match cause {
            Self::Unimplemented { .. } => cause,
            cause => Self::Unimplemented {
                cause: Box::new(cause),
            },
        }
    }

    /// Strip backtrace wrappers.
    pub fn inner(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.inner(),
            other => other,
        }
    }

    pub fn status(&self) -> Status {
        match self.inner() {
            Self::InvalidGraph(_) => Status::InvalidGraph,
            Self::ShapeInference { .. } => Status::InvalidShape,
            Self::UnsupportedOp { .. }
            | Self::UnsupportedAttr { .. }
            | Self::DeviceUnsupported { .. }
            | Self::Unimplemented { .. } => Status::Unimplemented,
            Self::MissingAttr { .. }
            | Self::Msg(_)
            | Self::IoError(_)
            | Self::Wrapped(_)
            | Self::WrappedContext { .. } => Status::InvalidArguments,
            Self::WithBacktrace { .. } => unreachable!("backtraces are stripped by `inner`"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach more context to an error.
///
/// Inspired by [`anyhow::Context`].
pub trait Context<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily
    /// only once an error does occur.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unimplemented_keeps_cause_and_does_not_nest() {
        let err = Error::unimplemented(Error::InvalidGraph("x".into()));
        let err = Error::unimplemented(err);
        match &err {
            Error::Unimplemented { cause } => {
                assert!(matches!(**cause, Error::InvalidGraph(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.status(), Status::Unimplemented);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::InvalidGraph("dangling".into()).status(),
            Status::InvalidGraph
        );
        assert_eq!(
            Error::ShapeInference {
                op_id: 0,
                kind: OpKind::Add,
                reason: String::new()
            }
            .status(),
            Status::InvalidShape
        );
        assert_eq!(Error::msg("boom").status(), Status::InvalidArguments);
    }
}
