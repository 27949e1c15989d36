//! The error taxonomy surfaced to user callbacks (§7).
//!
//! Daemon errors are mapped into [`ErrorKind`] at the Bus Facade boundary
//! ([`crate::bus`]) and never leak a raw `dbus::Error` above it.

use std::fmt;

/// Status codes surfaced to user callbacks, per §7's fixed taxonomy.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Operation completed as intended.
    Success,
    /// Daemon reports not-ready.
    BluezNotReady,
    /// Daemon rejects a duplicate operation already in progress.
    BluezOperationInProgress,
    /// Generic daemon failure.
    BluezOperationFailed,
    /// Property or operation not supported by the peer.
    BluezNotSupported,
    /// Connect failed at the link layer.
    ConnectionFailedEstablishment,
    /// ATT says the attribute cannot be read.
    ReadNotPermitted,
    /// ATT says the attribute cannot be written.
    WriteNotPermitted,
    /// Attribute does not support the requested verb.
    RequestNotSupported,
    /// Peer requires pairing that has not been satisfied.
    InsufficientAuthentication,
    /// Peer requires authorization that has not been satisfied.
    InsufficientAuthorization,
    /// Peer requires an encrypted link.
    InsufficientEncryption,
    /// Transport-level failure not otherwise classified.
    DbusExecutionException,
    /// Reported on lifecycle callbacks after a successful command.
    CommandSuccess,
    /// Argument rejected synchronously before any command was enqueued (§8
    /// boundary behavior). Not part of the daemon-facing table in §7, but
    /// required by the synchronous-validation invariants it describes.
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Success => "success",
            ErrorKind::BluezNotReady => "bluez not ready",
            ErrorKind::BluezOperationInProgress => "bluez operation in progress",
            ErrorKind::BluezOperationFailed => "bluez operation failed",
            ErrorKind::BluezNotSupported => "bluez operation not supported",
            ErrorKind::ConnectionFailedEstablishment => "connection failed at link layer",
            ErrorKind::ReadNotPermitted => "read not permitted",
            ErrorKind::WriteNotPermitted => "write not permitted",
            ErrorKind::RequestNotSupported => "request not supported",
            ErrorKind::InsufficientAuthentication => "insufficient authentication",
            ErrorKind::InsufficientAuthorization => "insufficient authorization",
            ErrorKind::InsufficientEncryption => "insufficient encryption",
            ErrorKind::DbusExecutionException => "dbus execution exception",
            ErrorKind::CommandSuccess => "command success",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(s)
    }
}

/// A mapped error: kind plus the daemon's own message, if any.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, message: String::new() }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error { kind, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::with_message(ErrorKind::InvalidArgument, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps a raw D-Bus error name (`org.bluez.Error.*`, `org.freedesktop.DBus.Error.*`)
/// to the fixed taxonomy of §7. Unrecognized names fall back to
/// `DbusExecutionException`, matching the propagation policy's requirement
/// that daemon errors never leak above the Bus Facade unclassified.
impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        let message = err.message().unwrap_or_default().to_string();
        let kind = match err.name().unwrap_or_default() {
            "org.bluez.Error.NotReady" => ErrorKind::BluezNotReady,
            "org.bluez.Error.InProgress" => ErrorKind::BluezOperationInProgress,
            "org.bluez.Error.Failed" => ErrorKind::BluezOperationFailed,
            "org.bluez.Error.NotSupported" => ErrorKind::BluezNotSupported,
            "org.bluez.Error.NotPermitted" => ErrorKind::WriteNotPermitted,
            "org.bluez.Error.NotAuthorized" => ErrorKind::InsufficientAuthorization,
            "org.bluez.Error.NotConnected" => ErrorKind::ConnectionFailedEstablishment,
            "org.bluez.Error.AlreadyConnected" => ErrorKind::Success,
            "org.bluez.Error.AuthenticationFailed" | "org.bluez.Error.AuthenticationRejected" => {
                ErrorKind::InsufficientAuthentication
            }
            "org.bluez.Error.AuthenticationCanceled" | "org.bluez.Error.AuthenticationTimeout" => {
                ErrorKind::InsufficientAuthentication
            }
            _ => ErrorKind::DbusExecutionException,
        };
        Error::with_message(kind, message)
    }
}

impl From<crate::api::bdaddr::ParseBDAddrError> for Error {
    fn from(err: crate::api::bdaddr::ParseBDAddrError) -> Self {
        Error::invalid_argument(err.to_string())
    }
}
