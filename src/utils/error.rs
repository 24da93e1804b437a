//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;
use std::sync::PoisonError;

/// Customized error type for the task board.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TaskboardError(pub String);

impl TaskboardError {
    /// Composes an error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        TaskboardError(m.to_string())
    }
}

impl fmt::Display for TaskboardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `TaskboardError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TaskboardError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TaskboardError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(FromUtf8Error);
impl_from_error!(TryFromIntError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::watch::error::RecvError);

impl<T> From<PoisonError<T>> for TaskboardError {
    fn from(e: PoisonError<T>) -> Self {
        TaskboardError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TaskboardError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TaskboardError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
