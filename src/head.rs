//! the value types the state machines pass around: request/response heads and the classified
//! request body framing.
//!
//! modeled as small `Clone` structs rather than reusing [`http::request::Parts`] /
//! [`http::response::Parts`] directly — both carry a non-`Clone` `Extensions` bag the machines
//! have no use for, and cloning a head is routine here (a redirect hands the observed response
//! head back to the delegate while the machine itself moves on to `Finished`).

use http::{HeaderMap, Method, StatusCode, Uri};

/// the request head as handed to [`crate::csm::ConnectionStateMachine::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeadState {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// the response head as observed off the wire.
///
/// the core only ever branches on `status.as_u16()` (`< 200`, `< 300`, `>= 300`); the headers
/// are carried through untouched for the delegate (e.g. a decompression middleware reading
/// `Content-Encoding`, or the redirect predicate reading `Location`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeadState {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHeadState {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    /// informational (`1xx`) — never forwarded to a delegate, never ends the response wait.
    pub(crate) fn is_informational(&self) -> bool {
        self.status.as_u16() < 200
    }

    /// success-class: the upload is allowed to proceed.
    pub(crate) fn is_success_class(&self) -> bool {
        self.status.as_u16() < 300
    }
}

/// request body framing, classified once up front so the state machine never has to look at
/// headers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBodyLength {
    None,
    FixedSize(u64),
    Stream,
}

impl RequestBodyLength {
    /// `Content-Length: n` wins over `Transfer-Encoding: chunked` if (incorrectly) both are
    /// present; neither present means no body at all.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        if let Some(len) = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            return Self::FixedSize(len);
        }
        if headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|s| s.eq_ignore_ascii_case("chunked"))
        {
            return Self::Stream;
        }
        Self::None
    }

    /// whether [`crate::csm::ConnectionStateMachine::start`] should begin streaming a body at
    /// all: `None` and `FixedSize(0)` both send an empty/no body and go straight to `EndSent`.
    pub(crate) fn starts_body(&self) -> bool {
        !matches!(self, Self::None | Self::FixedSize(0))
    }

    pub(crate) fn expected_len(&self) -> Option<u64> {
        match self {
            Self::FixedSize(n) => Some(*n),
            Self::None | Self::Stream => None,
        }
    }
}
