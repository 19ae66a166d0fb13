use crate::meta::Span;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Link error: {0}")]
    LinkError(String, Option<Span>),

    #[error("Recursive call chain: {0}")]
    CycleError(String, Vec<Span>),

    #[error("Invalid built-in: {0}")]
    BuiltInError(String, Option<Span>),

    #[error("Entry point error: {0}")]
    SignatureError(String, Option<Span>),

    #[error("Composite error: {0}")]
    CompositeError(String, Option<Span>),

    #[error("Backend invariant violation: {0}")]
    BackendError(String),

    #[error("Pass '{0}' failed: {1}")]
    PassError(String, String),
}

impl CompilerError {
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::LinkError(_, span) => *span,
            Self::CycleError(_, trace) => trace.first().copied(),
            Self::BuiltInError(_, span) => *span,
            Self::SignatureError(_, span) => *span,
            Self::CompositeError(_, span) => *span,
            Self::BackendError(_) | Self::PassError(_, _) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

// Bail macros without span

#[macro_export]
macro_rules! bail_link {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::LinkError(format!($($arg)*), None))
    };
}

#[macro_export]
macro_rules! bail_composite {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::CompositeError(format!($($arg)*), None))
    };
}

#[macro_export]
macro_rules! bail_backend {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::BackendError(format!($($arg)*)))
    };
}

// Bail macros with span

#[macro_export]
macro_rules! bail_link_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::LinkError(format!($($arg)*), Some($span)))
    };
}

#[macro_export]
macro_rules! bail_builtin_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::BuiltInError(format!($($arg)*), Some($span)))
    };
}

#[macro_export]
macro_rules! bail_signature_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::SignatureError(format!($($arg)*), Some($span)))
    };
}

#[macro_export]
macro_rules! bail_composite_at {
    ($span:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::CompositeError(format!($($arg)*), Some($span)))
    };
}
