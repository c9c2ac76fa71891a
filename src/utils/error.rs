//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for TRaft.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TraftError(pub String);

impl TraftError {
    /// Builds a `TraftError` from anything that prints, e.g. another error
    /// type being mapped over.
    pub fn msg(m: impl ToString) -> Self {
        TraftError(m.to_string())
    }
}

impl fmt::Display for TraftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `TraftError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TraftError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TraftError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TraftError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TraftError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
