//! Fixed-capacity URI handler registration table.
//!
//! Handlers are stored in registration order inside a plain `Vec` pre-sized
//! to [`ServerConfig::max_uri_handlers`](crate::config::ServerConfig). Lookup
//! is a linear scan, the same tradeoff the session table makes: handler
//! counts are small and registration is rare compared to request volume.

use crate::{
    engine::dispatch::WsSender,
    errors::ErrorKind,
    session::table::SessionHandle,
    uri::matcher::{self, CustomMatcher},
    ws::frame::Opcode,
    Handled, Method, Request, Response,
};
use std::{any::Any, cell::RefCell, future::Future, io, pin::Pin, rc::Rc};

/// An inbound websocket frame, delivered to a websocket handler through
/// [`SessionContext::ws_message`].
#[derive(Debug, Clone, Copy)]
pub struct WsMessage<'a> {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: &'a [u8],
}

/// Per-request access to the owning session's opaque user context, passed to
/// every handler alongside the request/response pair. Backs
/// `sess_set_ctx`/`sess_get_ctx`.
///
/// Borrows the handle's `user_ctx` cell only for the duration of `get`/`set`
/// themselves, never across an `.await` — a handler is free to call either
/// any number of times during its invocation.
///
/// Within a websocket handler, also carries the frame that triggered this
/// call ([`ws_message`](Self::ws_message)) and lets the handler push frames
/// of its own ([`ws_send_frame`](Self::ws_send_frame)). Both are `None`/inert
/// for a plain HTTP request.
pub struct SessionContext<'a> {
    ctx: &'a RefCell<Option<Box<dyn Any>>>,
    sender: Option<WsSender<'a>>,
    message: Option<WsMessage<'a>>,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(handle: &'a SessionHandle) -> Self {
        Self { ctx: &handle.user_ctx, sender: None, message: None }
    }

    pub(crate) fn new_websocket(handle: &'a SessionHandle, sender: WsSender<'a>, message: Option<WsMessage<'a>>) -> Self {
        Self { ctx: &handle.user_ctx, sender: Some(sender), message }
    }

    /// Returns a clone of the session's stored context if one is set and its
    /// concrete type matches `T`.
    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.ctx.borrow().as_deref()?.downcast_ref::<T>().cloned()
    }

    /// Replaces the session's stored context, discarding any previous value
    /// regardless of its type.
    pub fn set<T: 'static>(&mut self, value: T) {
        *self.ctx.borrow_mut() = Some(Box::new(value));
    }

    /// The frame that triggered this call. `None` for plain HTTP requests and
    /// for the "opened" invocation right after a successful handshake.
    pub fn ws_message(&self) -> Option<&WsMessage<'a>> {
        self.message.as_ref()
    }

    /// Sends a frame to the peer. Returns `Err(NotConnected)` outside of a
    /// websocket handler.
    pub async fn ws_send_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not a websocket connection"));
        };
        sender.send(fin, opcode, payload).await
    }
}

/// Type-erased async handler body, boxed once at registration time.
///
/// The engine is single-threaded (a single `current_thread` runtime driving
/// one `LocalSet`), so handlers are `Rc`-shared rather than `Arc`-shared and
/// carry no `Send`/`Sync` bound.
pub(crate) type BoxedHandler = Rc<
    dyn Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Pin<Box<dyn Future<Output = Handled> + '_>>,
>;

/// Boxes a generic handler closure into a [`Registration`] for a plain
/// (non-websocket) endpoint. Shared by the builder's pre-start registration
/// and `EngineContext`'s post-start registration so both stay in sync.
pub(crate) fn boxed_registration<F, Fut>(
    method: Method,
    uri: &str,
    custom_matcher: Option<CustomMatcher>,
    handler: F,
) -> Registration
where
    F: Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Fut + 'static,
    Fut: Future<Output = Handled> + 'static,
{
    Registration {
        method,
        uri: uri.as_bytes().into(),
        custom_matcher,
        handler: Rc::new(move |req, resp, ctx| {
            Box::pin(handler(req, resp, ctx)) as Pin<Box<dyn Future<Output = Handled> + '_>>
        }),
        is_websocket: false,
        handle_ws_control_frames: false,
    }
}

pub(crate) struct Registration {
    pub(crate) method: Method,
    pub(crate) uri: Box<[u8]>,
    pub(crate) custom_matcher: Option<CustomMatcher>,
    pub(crate) handler: BoxedHandler,
    pub(crate) is_websocket: bool,
    pub(crate) handle_ws_control_frames: bool,
}

pub(crate) struct HandlerTable {
    entries: Vec<Registration>,
    capacity: usize,
}

/// Why `register_uri_handler` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The table already holds `max_uri_handlers` entries.
    HandlersFull,
    /// An entry with the same method and URI is already registered.
    HandlerExists,
}

/// Outcome of a lookup: which entry to invoke, or which canned error to send
/// per the method-mismatch-vs-no-match distinction.
pub(crate) enum Lookup<'a> {
    Found(&'a Registration),
    MethodMismatch,
    NoMatch,
}

impl HandlerTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a handler. Returns `Err` if the table is already full or an
    /// identical `(method, uri)` pair is already registered.
    pub(crate) fn register(&mut self, registration: Registration) -> Result<(), RegisterError> {
        if self
            .entries
            .iter()
            .any(|e| e.method == registration.method && e.uri == registration.uri)
        {
            return Err(RegisterError::HandlerExists);
        }

        if self.entries.len() >= self.capacity {
            return Err(RegisterError::HandlersFull);
        }

        self.entries.push(registration);
        Ok(())
    }

    /// Removes every registration for `uri`, regardless of method. Returns
    /// the number of entries removed.
    pub(crate) fn unregister_uri(&mut self, uri: &[u8]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| &*e.uri != uri);
        before - self.entries.len()
    }

    /// Removes the single `(method, uri)` registration, if present.
    pub(crate) fn unregister(&mut self, method: Method, uri: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.method == method && &*e.uri == uri));
        before != self.entries.len()
    }

    /// Scans registrations in order. The first whose pattern matches the
    /// path wins if its method also matches; a pattern match with a
    /// different method records a 405 candidate rather than returning
    /// immediately, since a later entry might match both.
    pub(crate) fn lookup(&self, method: Method, path: &[u8]) -> Lookup<'_> {
        let mut method_mismatch = false;

        for entry in &self.entries {
            let matched = match entry.custom_matcher {
                Some(custom) => custom(&entry.uri, path, path.len()),
                None => matcher::matches(&entry.uri, path),
            };

            if !matched {
                continue;
            }

            if entry.method == method {
                return Lookup::Found(entry);
            }

            method_mismatch = true;
        }

        match method_mismatch {
            true => Lookup::MethodMismatch,
            false => Lookup::NoMatch,
        }
    }
}

/// The subset of canned error outcomes a caller may override with a custom
/// handler via `register_err_handler`. `Io` is deliberately absent — a
/// transport fault tears the session down without ever writing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrCode {
    BadRequest,
    UriTooLong,
    HeaderFieldsTooLarge,
    MethodNotAllowed,
    NotFound,
    RequestTimeout,
    LengthRequired,
    VersionNotSupported,
    InternalError,
}

impl ErrCode {
    pub(crate) fn from_kind(kind: &ErrorKind) -> Option<Self> {
        Some(match kind {
            ErrorKind::BadRequest | ErrorKind::Query(_) => Self::BadRequest,
            ErrorKind::UriTooLong => Self::UriTooLong,
            ErrorKind::HeaderFieldsTooLarge => Self::HeaderFieldsTooLarge,
            ErrorKind::MethodNotAllowed => Self::MethodNotAllowed,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::RequestTimeout => Self::RequestTimeout,
            ErrorKind::LengthRequired => Self::LengthRequired,
            ErrorKind::VersionNotSupported => Self::VersionNotSupported,
            ErrorKind::InternalError => Self::InternalError,
            ErrorKind::Io(_) => return None,
        })
    }
}

pub(crate) type BoxedErrHandler = Rc<dyn Fn(&Request, &mut Response) -> Handled>;

/// Sparse override table consulted before falling back to an engine's canned
/// error body. Small and rarely written, so a `Vec` of pairs beats a hash map.
#[derive(Default)]
pub(crate) struct ErrHandlerTable {
    entries: Vec<(ErrCode, BoxedErrHandler)>,
}

impl ErrHandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, code: ErrCode, handler: BoxedErrHandler) {
        self.entries.retain(|(c, _)| *c != code);
        self.entries.push((code, handler));
    }

    pub(crate) fn get(&self, code: ErrCode) -> Option<&BoxedErrHandler> {
        self.entries.iter().find(|(c, _)| *c == code).map(|(_, h)| h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    fn noop_registration(method: Method, uri: &str) -> Registration {
        Registration {
            method,
            uri: uri.as_bytes().into(),
            custom_matcher: None,
            handler: Rc::new(|_, resp, _ctx| {
                Box::pin(async move { resp.status(crate::StatusCode::Ok).body("") })
                    as Pin<Box<dyn Future<Output = Handled> + '_>>
            }),
            is_websocket: false,
            handle_ws_control_frames: false,
        }
    }

    #[test]
    fn first_match_in_registration_order_wins() {
        let mut table = HandlerTable::new(8);
        table.register(noop_registration(Method::Get, "/api/*")).unwrap();
        table.register(noop_registration(Method::Get, "/api/users")).unwrap();

        match table.lookup(Method::Get, b"/api/users") {
            Lookup::Found(entry) => assert_eq!(&*entry.uri, b"/api/*"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn method_mismatch_then_no_match_elsewhere_is_still_405() {
        let mut table = HandlerTable::new(8);
        table.register(noop_registration(Method::Post, "/api/users")).unwrap();

        assert!(matches!(table.lookup(Method::Get, b"/api/users"), Lookup::MethodMismatch));
        assert!(matches!(table.lookup(Method::Get, b"/other"), Lookup::NoMatch));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = HandlerTable::new(1);
        table.register(noop_registration(Method::Get, "/a")).unwrap();
        assert!(table.register(noop_registration(Method::Get, "/b")).is_err());
    }

    #[test]
    fn duplicate_method_and_uri_is_rejected() {
        let mut table = HandlerTable::new(8);
        table.register(noop_registration(Method::Get, "/a")).unwrap();
        assert!(table.register(noop_registration(Method::Get, "/a")).is_err());
    }

    #[test]
    fn unregister_uri_removes_every_method() {
        let mut table = HandlerTable::new(8);
        table.register(noop_registration(Method::Get, "/a")).unwrap();
        table.register(noop_registration(Method::Post, "/a")).unwrap();

        assert_eq!(table.unregister_uri(b"/a"), 2);
        assert!(matches!(table.lookup(Method::Get, b"/a"), Lookup::NoMatch));
    }

    #[test]
    fn duplicate_is_reported_even_when_table_is_also_full() {
        let mut table = HandlerTable::new(1);
        table.register(noop_registration(Method::Get, "/a")).unwrap();

        assert_eq!(
            table.register(noop_registration(Method::Get, "/a")),
            Err(RegisterError::HandlerExists)
        );
    }

    #[test]
    fn full_table_reports_handlers_full() {
        let mut table = HandlerTable::new(1);
        table.register(noop_registration(Method::Get, "/a")).unwrap();

        assert_eq!(
            table.register(noop_registration(Method::Get, "/b")),
            Err(RegisterError::HandlersFull)
        );
    }

    #[test]
    fn err_code_from_kind_maps_every_wire_variant() {
        assert_eq!(ErrCode::from_kind(&ErrorKind::BadRequest), Some(ErrCode::BadRequest));
        assert_eq!(ErrCode::from_kind(&ErrorKind::UriTooLong), Some(ErrCode::UriTooLong));
        assert_eq!(ErrCode::from_kind(&ErrorKind::NotFound), Some(ErrCode::NotFound));
        assert_eq!(ErrCode::from_kind(&ErrorKind::InternalError), Some(ErrCode::InternalError));
    }

    #[test]
    fn err_code_from_kind_has_no_mapping_for_io() {
        let io_err = ErrorKind::from(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(ErrCode::from_kind(&io_err), None);
    }

    #[test]
    fn err_handler_table_registration_replaces_by_code() {
        let mut table = ErrHandlerTable::new();
        let first: BoxedErrHandler = Rc::new(|_req, resp| resp.status(crate::StatusCode::Ok).body("first"));
        let second: BoxedErrHandler = Rc::new(|_req, resp| resp.status(crate::StatusCode::Ok).body("second"));

        table.register(ErrCode::NotFound, first);
        assert!(table.get(ErrCode::NotFound).is_some());
        assert!(table.get(ErrCode::BadRequest).is_none());

        table.register(ErrCode::NotFound, second);
        assert_eq!(table.entries.len(), 1);
    }
}
