//! Per-call scratch state and its recycling pool.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::frame::{RequestHeader, ResponseHeader, RpcErrorKind};

/// Mutable state carried through one call from header read to response
/// write.
///
/// Contexts are drawn from the server's pool when a request arrives and
/// returned once the response is written (or the call is dropped), so every
/// field is reset between calls. Hooks and invokers receive `&mut
/// CallContext`; exclusive access is what lets plugins mutate the call
/// without further locking.
#[derive(Debug, Default)]
pub struct CallContext {
    pub(crate) req: RequestHeader,
    pub(crate) resp: ResponseHeader,
    pub(crate) argument: Bytes,
    pub(crate) reply: Vec<u8>,
    pub(crate) service_path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) error_kind: RpcErrorKind,
    pub(crate) suppress_response: bool,
    data: HashMap<String, String>,
}

impl CallContext {
    /// Request header as decoded from the wire.
    #[must_use]
    pub fn request(&self) -> &RequestHeader {
        &self.req
    }

    /// Response header under construction.
    #[must_use]
    pub fn response(&self) -> &ResponseHeader {
        &self.resp
    }

    /// Resolved service path with any query string stripped.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.service_path
    }

    /// Sequence number of the call.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.req.seq
    }

    /// Rewrite the dispatch target. When a `post_read_request_header` hook
    /// changes the target, the server resolves the service again before
    /// reading the body.
    pub fn set_service_method(&mut self, service_method: impl Into<String>) {
        self.req.service_method = service_method.into();
    }

    /// Raw encoded argument bytes, available once the body frame is read.
    #[must_use]
    pub fn argument(&self) -> &Bytes {
        &self.argument
    }

    /// Replace the encoded argument. Body hooks use this to transform the
    /// payload before the invoker decodes it.
    pub fn set_argument(&mut self, argument: Bytes) {
        self.argument = argument;
    }

    /// Encoded reply bytes, available to `pre_write_response` hooks.
    #[must_use]
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// Replace the encoded reply before it is written.
    pub fn set_reply(&mut self, reply: Vec<u8>) {
        self.reply = reply;
    }

    /// First query parameter with the given key, if the call path carried a
    /// query string.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All query parameters in order of appearance.
    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Classification of the call's failure, if any.
    #[must_use]
    pub fn error_kind(&self) -> RpcErrorKind {
        self.error_kind
    }

    /// Store a value in the plugin-visible key/value bag.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// Fetch a value from the key/value bag.
    #[must_use]
    pub fn data(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub(crate) fn parse_query(&mut self, raw: &str) {
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => self.query.push((k.to_owned(), v.to_owned())),
                None => self.query.push((pair.to_owned(), String::new())),
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.req.reset();
        self.resp.reset();
        self.argument = Bytes::new();
        self.reply.clear();
        self.service_path.clear();
        self.query.clear();
        self.error_kind = RpcErrorKind::None;
        self.suppress_response = false;
        self.data.clear();
    }
}

/// Free list of call contexts, owned by the server.
///
/// Contexts are fully reset before they re-enter the list, so acquisition
/// always observes zero-valued state.
#[derive(Debug, Default)]
pub(crate) struct ContextPool {
    free: Mutex<Vec<Box<CallContext>>>,
}

impl ContextPool {
    pub(crate) fn acquire(&self) -> Box<CallContext> {
        self.free
            .lock()
            .expect("context pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub(crate) fn release(&self, mut ctx: Box<CallContext>) {
        ctx.reset();
        self.free
            .lock()
            .expect("context pool lock poisoned")
            .push(ctx);
    }
}
