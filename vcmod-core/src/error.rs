//! Error taxonomy shared by every component.
//!
//! Every failure that reaches the exit envelope carries exactly one
//! [`ErrorKind`]. Remote faults keep their server name so callers can
//! inspect them (for example the certificate-trust retry), and are
//! classified lazily through [`Error::kind`].

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Stable, machine-readable failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    InvalidArgument,
    AuthFailed,
    Forbidden,
    NotFound,
    Ambiguous,
    AlreadyExists,
    PreconditionFailed,
    ConnectError,
    #[serde(rename = "TLSError")]
    TlsError,
    Timeout,
    RemoteFailure,
    Unsupported,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Ambiguous => "Ambiguous",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::ConnectError => "ConnectError",
            ErrorKind::TlsError => "TLSError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RemoteFailure => "RemoteFailure",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed fault returned by a vSphere endpoint (SOAP fault, REST error,
/// or the error of a failed task).
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Server type name, e.g. `InvalidLogin` or `NOT_FOUND`.
    pub name: String,
    pub message: String,
    /// Structured fault payload, `Value::Null` when the server sent none.
    pub detail: Value,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Classify the fault into the engine taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self.name.as_str() {
            "InvalidLogin" | "NotAuthenticated" | "UNAUTHENTICATED" => ErrorKind::AuthFailed,
            "NoPermission" | "UNAUTHORIZED" => ErrorKind::Forbidden,
            "NotFound" | "ManagedObjectNotFound" | "NOT_FOUND" => ErrorKind::NotFound,
            "InvalidState" | "InvalidPowerState" | "InvalidHostState" | "HostNotInMaintenance"
            | "TaskInProgress" | "NOT_ALLOWED_IN_CURRENT_STATE" => ErrorKind::PreconditionFailed,
            "DuplicateName" | "AlreadyExists" | "ALREADY_EXISTS" => ErrorKind::AlreadyExists,
            "InvalidArgument" | "InvalidName" | "InvalidRequest" | "InvalidType"
            | "InvalidProperty" | "INVALID_ARGUMENT" => ErrorKind::InvalidArgument,
            "NotSupported" | "NotImplemented" | "UNSUPPORTED" => ErrorKind::Unsupported,
            _ => ErrorKind::RemoteFailure,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("authentication to {endpoint} failed: {reason}")]
    AuthFailed { endpoint: String, reason: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Ambiguous(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("unable to connect to {endpoint}: {reason}")]
    ConnectError { endpoint: String, reason: String },

    #[error("TLS negotiation with {endpoint} failed: {reason}")]
    TlsError { endpoint: String, reason: String },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Remote(Fault),

    #[error("internal error: {0}")]
    Internal(String),

    /// A failure inside one step of a multi-step protocol.
    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::AuthFailed { .. } => ErrorKind::AuthFailed,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Ambiguous(_) => ErrorKind::Ambiguous,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::ConnectError { .. } => ErrorKind::ConnectError,
            Error::TlsError { .. } => ErrorKind::TlsError,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Remote(fault) => fault.kind(),
            Error::Internal(_) => ErrorKind::Internal,
            Error::Step { source, .. } => source.kind(),
        }
    }

    /// The remote fault behind this error, looking through step wrappers.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Remote(fault) => Some(fault),
            Error::Step { source, .. } => source.fault(),
            _ => None,
        }
    }

    /// Structured detail for the envelope's `details` key.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::Remote(fault) => {
                let mut details = serde_json::Map::new();
                details.insert("fault".into(), Value::String(fault.name.clone()));
                if !fault.detail.is_null() {
                    details.insert("detail".into(), fault.detail.clone());
                }
                Some(Value::Object(details))
            }
            Error::Step { step, source } => {
                let mut details = match source.details() {
                    Some(Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                details.insert("step".into(), Value::String(step.clone()));
                Some(Value::Object(details))
            }
            Error::AuthFailed { endpoint, .. }
            | Error::ConnectError { endpoint, .. }
            | Error::TlsError { endpoint, .. } => {
                Some(serde_json::json!({ "endpoint": endpoint }))
            }
            _ => None,
        }
    }

    /// Wrap this error as the failure of a named protocol step.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Error::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Remote(fault)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        let cases = [
            ("InvalidLogin", ErrorKind::AuthFailed),
            ("NoPermission", ErrorKind::Forbidden),
            ("NotFound", ErrorKind::NotFound),
            ("InvalidState", ErrorKind::PreconditionFailed),
            ("DuplicateName", ErrorKind::AlreadyExists),
            ("InvalidArgument", ErrorKind::InvalidArgument),
            ("InvalidName", ErrorKind::InvalidArgument),
            ("InvalidRequest", ErrorKind::InvalidArgument),
            ("HostConfigFault", ErrorKind::RemoteFailure),
            ("RuntimeFault", ErrorKind::RemoteFailure),
            ("MethodFault", ErrorKind::RemoteFailure),
        ];
        for (name, kind) in cases {
            assert_eq!(Fault::new(name, "x").kind(), kind, "fault {name}");
        }
    }

    #[test]
    fn test_remote_fault_never_internal() {
        let err = Error::from(Fault::new("SomethingNobodyHeardOf", "boom"));
        assert_eq!(err.kind(), ErrorKind::RemoteFailure);
    }

    #[test]
    fn test_step_keeps_kind_and_names_step() {
        let err = Error::from(Fault::new("InvalidState", "host busy"))
            .in_step("entering maintenance mode");
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(
            err.to_string(),
            "entering maintenance mode: InvalidState: host busy"
        );
        let details = err.details().unwrap();
        assert_eq!(details["step"], "entering maintenance mode");
        assert_eq!(details["fault"], "InvalidState");
    }

    #[test]
    fn test_tls_kind_serializes_as_spelled() {
        let json = serde_json::to_string(&ErrorKind::TlsError).unwrap();
        assert_eq!(json, "\"TLSError\"");
    }
}
