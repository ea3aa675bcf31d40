//! The error taxonomy a caller of the BMI facade can observe, either
//! synchronously from a `post_*` call or asynchronously via a completion.

use std::fmt;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BmiError>;

/// Errors surfaced by the transport. Variants map 1:1 onto spec §7's
/// abstract taxonomy; `Io` is the one addition, wrapping OS-level failures
/// from the OOB setup layer (`nix`/`std::io`) that the taxonomy otherwise
/// has no slot for.
#[derive(Error, Debug)]
pub enum BmiError {
    /// Bad URL, unresolved host, extra trailing characters, missing port.
    #[error("address error: {0}")]
    Address(String),

    /// `post_*` to an unconnected peer with `reconnect` clear.
    #[error("peer is not connected and reconnect was not requested")]
    NotConnected,

    /// Pool exhaustion, registration failure, mapped-buffer exhaustion.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Malformed header, size-mismatched CTS, impossible state transition,
    /// unknown message type.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// CQ work-completion error, async event indicating QP failure, BYE
    /// received mid-operation, CM rejection/unreachable.
    #[error("peer error: {0}")]
    Peer(String),

    /// User-initiated cancel.
    #[error("operation was cancelled")]
    Cancelled,

    /// Unexpected send exceeding eager payload, or receive buffer too
    /// small for the arrived eager payload.
    #[error("oversize: {0}")]
    Oversize(String),

    /// An argument failed validation (`EINVAL`-shaped failures not
    /// otherwise covered by `Protocol`/`Address`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lower-level OS/socket/CM failure from the OOB setup path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `nix` syscall wrapper failure from the OOB setup path.
    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),
}

impl BmiError {
    /// Stable, low-cardinality tag for log fields and completion status
    /// codes — mirrors the original implementation's integer error codes
    /// without committing callers to our internal variant set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BmiError::Address(_) => ErrorKind::Address,
            BmiError::NotConnected => ErrorKind::NotConnected,
            BmiError::Resource(_) => ErrorKind::Resource,
            BmiError::Protocol(_) => ErrorKind::Protocol,
            BmiError::Peer(_) => ErrorKind::Peer,
            BmiError::Cancelled => ErrorKind::Cancelled,
            BmiError::Oversize(_) => ErrorKind::Oversize,
            BmiError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BmiError::Io(_) => ErrorKind::Io,
            BmiError::Errno(_) => ErrorKind::Io,
        }
    }
}

/// The status code carried in a completion tuple `(op_id, status, size,
/// user_ptr)` per spec §7. `Ok` is status success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    Address,
    NotConnected,
    Resource,
    Protocol,
    Peer,
    Cancelled,
    Oversize,
    InvalidArgument,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::Address => "address",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::Resource => "resource",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Peer => "peer",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Oversize => "oversize",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_for_every_variant() {
        assert_eq!(BmiError::NotConnected.kind(), ErrorKind::NotConnected);
        assert_eq!(BmiError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            BmiError::Oversize("too big".into()).kind(),
            ErrorKind::Oversize
        );
        assert_eq!(
            BmiError::Protocol("bad header".into()).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn display_is_human_readable() {
        let e = BmiError::Address("missing port".into());
        assert_eq!(e.to_string(), "address error: missing port");
    }
}
