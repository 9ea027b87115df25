//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for RepliKV.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RepliKvError(pub String);

impl RepliKvError {
    /// Creates an error out of anything displayable.
    pub fn msg(e: impl fmt::Display) -> Self {
        RepliKvError(e.to_string())
    }
}

impl fmt::Display for RepliKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `RepliKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RepliKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RepliKvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RepliKvError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = RepliKvError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
