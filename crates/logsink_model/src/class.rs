//! Transient/permanent classification of failures.
//!
//! Every failure the pipeline can meet implements [`Classify`]. The consumer
//! loop only ever asks that one question: retry, or set the record aside.

use std::io;

/// Whether a failure may go away on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retrying the same operation may succeed (network, timeout, unavailability).
    Transient,
    /// Retrying will fail the same way (malformed data, validation, authorization).
    Permanent,
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Transient`].
    pub fn is_transient(self) -> bool {
        self == ErrorClass::Transient
    }

    /// Returns true for [`ErrorClass::Permanent`].
    pub fn is_permanent(self) -> bool {
        self == ErrorClass::Permanent
    }

    /// Short lowercase label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure that knows whether it is worth retrying.
///
/// Implementations must answer [`ErrorClass::Transient`] for anything they
/// do not recognise, so unknown failures stay inside the bounded retry
/// budget instead of being dropped.
pub trait Classify {
    /// Classifies the failure.
    fn class(&self) -> ErrorClass;

    /// Returns true if the failure is transient.
    fn is_transient(&self) -> bool {
        self.class().is_transient()
    }
}

/// Classifies any failure.
pub fn classify<E: Classify + ?Sized>(error: &E) -> ErrorClass {
    error.class()
}

impl Classify for io::Error {
    fn class(&self) -> ErrorClass {
        match self.kind() {
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Unsupported => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_network_errors_are_transient() {
        for kind in [
            io::ErrorKind::TimedOut,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::Interrupted,
        ] {
            let err = io::Error::new(kind, "network");
            assert_eq!(classify(&err), ErrorClass::Transient, "{kind:?}");
        }
    }

    #[test]
    fn io_permission_is_permanent() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify(&err), ErrorClass::Permanent);
    }

    #[test]
    fn unknown_io_kind_defaults_to_transient() {
        let err = io::Error::new(io::ErrorKind::Other, "something odd");
        assert!(err.is_transient());
    }

    #[test]
    fn class_labels() {
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
        assert_eq!(ErrorClass::Permanent.as_str(), "permanent");
    }
}
