//! Error types for the tensel middle-end.
//!
//! All passes report failures through [`CompilerError`]; there is no local
//! recovery. Shape errors carry a pre-formatted trace of the offending rows,
//! dims, or index vectors. Virtualization rejections carry the numeric
//! provenance code that was stamped on the array's memory mode, so a log
//! line can be matched to the check that produced it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompilerError>;

#[derive(Debug, Error)]
pub enum CompilerError {
    /// Row/dim mismatch, axis-count mismatch, label mismatch, unsatisfiable
    /// `TotalElems`, einsum label-set mismatch, or a row-variable occurs
    /// failure (infinite axes).
    #[error("Shape error: {message}{trace}")]
    Shape { message: String, trace: String },

    /// A broken analysis invariant, e.g. two arrays claiming the same loop
    /// iterator.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A virtualization invariant violation: a consumer read a dead virtual
    /// array during cleanup, or a user-forced-virtual array failed
    /// acceptance.
    #[error("Virtualization error (code {code}): {message}")]
    Virtualization { message: String, code: u8 },

    /// IR the optimizer cannot handle where it found it.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O failure surfaced as-is with the offending source name.
    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Create a `CompilerError::Shape` without a trace.
#[macro_export]
macro_rules! err_shape {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Shape {
            message: format!($($arg)*),
            trace: String::new(),
        }
    };
}

/// Create a `CompilerError::Shape` carrying a trace of offending values.
/// The trace entries are `Debug`-formatted, one per line.
#[macro_export]
macro_rules! err_shape_trace {
    ([$($entry:expr),* $(,)?], $($arg:tt)*) => {{
        let mut trace = String::new();
        $(trace.push_str(&format!("\n  in: {:?}", $entry));)*
        $crate::error::CompilerError::Shape {
            message: format!($($arg)*),
            trace,
        }
    }};
}

/// Return early with a `CompilerError::Shape`.
#[macro_export]
macro_rules! bail_shape {
    ($($arg:tt)*) => {
        return Err($crate::err_shape!($($arg)*))
    };
}

/// Return early with a traced `CompilerError::Shape`.
#[macro_export]
macro_rules! bail_shape_trace {
    ([$($entry:expr),* $(,)?], $($arg:tt)*) => {
        return Err($crate::err_shape_trace!([$($entry),*], $($arg)*))
    };
}

/// Create a `CompilerError::Analysis`.
#[macro_export]
macro_rules! err_analysis {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Analysis(format!($($arg)*))
    };
}

/// Return early with a `CompilerError::Analysis`.
#[macro_export]
macro_rules! bail_analysis {
    ($($arg:tt)*) => {
        return Err($crate::err_analysis!($($arg)*))
    };
}

/// Create a `CompilerError::Virtualization` with a provenance code.
#[macro_export]
macro_rules! err_virtual {
    ($code:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::Virtualization {
            message: format!($($arg)*),
            code: $code,
        }
    };
}

/// Return early with a `CompilerError::Virtualization`.
#[macro_export]
macro_rules! bail_virtual {
    ($code:expr, $($arg:tt)*) => {
        return Err($crate::err_virtual!($code, $($arg)*))
    };
}

/// Create a `CompilerError::Unsupported`.
#[macro_export]
macro_rules! err_unsupported {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Unsupported(format!($($arg)*))
    };
}

/// Return early with a `CompilerError::Unsupported`.
#[macro_export]
macro_rules! bail_unsupported {
    ($($arg:tt)*) => {
        return Err($crate::err_unsupported!($($arg)*))
    };
}
