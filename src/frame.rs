//! Wire-level header pair exchanged for every call.
//!
//! A call is the logical triple `(header, body)` in each direction. The
//! physical layout of both frames belongs to the [`Codec`](crate::codec::Codec);
//! this module only defines the header values every codec must carry and the
//! handful of constants shared with the historical HTTP CONNECT contract.

use serde::{Deserialize, Serialize};

/// Status text written after a successful HTTP CONNECT hijack.
///
/// Kept byte-for-byte for compatibility with clients that speak the
/// historical handshake.
pub const CONNECTED: &str = "200 Connected to Go RPC";

/// Default URL path answering the HTTP CONNECT handshake.
pub const DEFAULT_RPC_PATH: &str = "/_goRPC_";

/// Header framing one request.
///
/// `seq` is assigned by the client and echoed verbatim in the matching
/// [`ResponseHeader`] so responses can complete out of order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Registered service path the call targets, optionally carrying a
    /// query string (`/arith/mul?trace=1`).
    pub service_method: String,
    /// Per-connection correlation number.
    pub seq: u64,
}

impl RequestHeader {
    pub(crate) fn reset(&mut self) {
        self.service_method.clear();
        self.seq = 0;
    }
}

/// Header framing one response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Mirrors the request's `service_method`.
    pub service_method: String,
    /// Mirrors the request's `seq`.
    pub seq: u64,
    /// Empty on success; otherwise the error text for the client.
    pub error: String,
}

impl ResponseHeader {
    /// Whether this response carries an error instead of a reply body.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub(crate) fn reset(&mut self) {
        self.service_method.clear();
        self.seq = 0;
        self.error.clear();
    }
}

/// Classification recorded on the call context when a call fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The call has not failed.
    #[default]
    None,
    /// No service is registered under the requested path.
    Dispatch,
    /// The service method returned an error.
    Service,
    /// The service method panicked and was recovered.
    ServicePanic,
    /// A plugin vetoed the call.
    Plugin,
}
