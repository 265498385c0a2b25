//! strongly typed error surface for the per-request state machines.

use std::{error, fmt, io, sync::Arc};

/// crate-wide error type.
///
/// an [`Io`](Error::Io) / [`Std`](Error::Std) catch-all for whatever an embedder's transport
/// surfaces through [`crate::csm::ConnectionStateMachine::error_happened`], plus named variants
/// for the errors the state machines themselves can produce.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    Io(io::ErrorKind),
    Std(Arc<dyn error::Error + Send + Sync>),
    /// the request was cancelled by its owner before or during execution.
    Cancelled,
    /// the remote peer closed the connection unexpectedly.
    RemoteConnectionClosed,
    /// no bytes were read off the channel within the idle-read timeout window.
    ReadTimeout,
    /// the declared `Content-Length` did not match the number of bytes actually sent.
    BodyLengthMismatch { expected: u64, sent: u64 },
    /// a body part arrived after the request stream had already signalled completion.
    WriteAfterRequestSent,
    /// the request body producer was cancelled while paused or producing.
    RequestStreamCancelled,
    /// ALPN negotiated a protocol this client has no handler for.
    ServerOfferedUnsupportedApplicationProtocol(String),
    /// the transport-level connect attempt did not complete in time.
    ConnectTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e.kind())
    }
}

impl From<io::ErrorKind> for Error {
    fn from(e: io::ErrorKind) -> Self {
        Self::Io(e)
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self::Std(e.into())
    }
}

// manual impl: `Std`'s trait object payload can't derive PartialEq, but tests (and callers
// checking `failWithConsumptionError`'s first-error-wins rule) need to compare the named variants.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a == b,
            (Self::Cancelled, Self::Cancelled)
            | (Self::RemoteConnectionClosed, Self::RemoteConnectionClosed)
            | (Self::ReadTimeout, Self::ReadTimeout)
            | (Self::WriteAfterRequestSent, Self::WriteAfterRequestSent)
            | (Self::RequestStreamCancelled, Self::RequestStreamCancelled)
            | (Self::ConnectTimeout, Self::ConnectTimeout) => true,
            (Self::BodyLengthMismatch { expected: e1, sent: s1 }, Self::BodyLengthMismatch { expected: e2, sent: s2 }) => {
                e1 == e2 && s1 == s2
            }
            (
                Self::ServerOfferedUnsupportedApplicationProtocol(a),
                Self::ServerOfferedUnsupportedApplicationProtocol(b),
            ) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}
