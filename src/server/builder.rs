//! Public entry point: configure, bind, launch.
//!
//! Fluent builder shape (panic-on-missing-required-field via
//! `#[track_caller]`, a `build()` that hands back a concrete value rather
//! than a trait object) over a single-threaded engine with a URI-dispatch
//! table — see [`crate::engine`].

use crate::{
    config::{ConnLimits, ReqLimits, RespLimits, ServerConfig, WsLimits},
    engine::{
        accept::AcceptLoop,
        control::{control_pair, ControlHandle, ControlPlane},
    },
    session::table::SessionTable,
    uri::handlers::{boxed_registration, ErrCode, ErrHandlerTable, HandlerTable, RegisterError},
    uri::matcher::CustomMatcher,
    Handled, Method, Request, Response, SessionContext,
};
use std::{cell::RefCell, future::Future, io, net::SocketAddr, rc::Rc};
use tokio::net::TcpListener;

/// Builds a [`Server`] by configuring limits and pre-registering handlers.
///
/// Handlers may also be registered after [`Server::launch`] starts, through
/// [`ControlHandle::queue_work`] and [`EngineContext::register_uri_handler`];
/// this builder only covers the common case of registering everything before
/// the first request can arrive.
pub struct ServerBuilder {
    server_config: ServerConfig,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    ws_limits: WsLimits,
    handlers: HandlerTable,
    err_handlers: ErrHandlerTable,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        let server_config = ServerConfig::default();
        Self {
            handlers: HandlerTable::new(server_config.max_uri_handlers),
            server_config,
            conn_limits: ConnLimits::default(),
            req_limits: ReqLimits::default(),
            resp_limits: RespLimits::default(),
            ws_limits: WsLimits::default(),
            err_handlers: ErrHandlerTable::new(),
        }
    }
}

impl ServerBuilder {
    /// Overrides socket admission policy, timeouts, and buffer sizing.
    /// Replaces the handler table's capacity if `max_uri_handlers` differs
    /// from the default, provided no handler has been registered yet.
    #[track_caller]
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        if config.max_uri_handlers != self.server_config.max_uri_handlers {
            assert!(
                self.handlers.is_empty(),
                "server_config must be set before registering any handlers if it changes max_uri_handlers"
            );
            self.handlers = HandlerTable::new(config.max_uri_handlers);
        }
        self.server_config = config;
        self
    }

    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = limits;
        self
    }

    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = limits;
        self
    }

    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.resp_limits = limits;
        self
    }

    pub fn ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = limits;
        self
    }

    /// Registers a handler for `(method, uri)`. `uri` uses the `*`/`?`
    /// wildcard alphabet described in [`crate::uri`]; pass a
    /// [`CustomMatcher`] for anything more elaborate.
    pub fn register_uri_handler<F, Fut>(
        mut self,
        method: Method,
        uri: &str,
        handler: F,
    ) -> Result<Self, RegisterError>
    where
        F: Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Fut + 'static,
        Fut: Future<Output = Handled> + 'static,
    {
        self.handlers.register(boxed_registration(method, uri, None, handler))?;
        Ok(self)
    }

    /// Same as [`register_uri_handler`](Self::register_uri_handler) but with
    /// an explicit custom matcher instead of the built-in wildcard alphabet.
    pub fn register_uri_handler_matching<F, Fut>(
        mut self,
        method: Method,
        uri: &str,
        matcher: CustomMatcher,
        handler: F,
    ) -> Result<Self, RegisterError>
    where
        F: Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Fut + 'static,
        Fut: Future<Output = Handled> + 'static,
    {
        self.handlers.register(boxed_registration(method, uri, Some(matcher), handler))?;
        Ok(self)
    }

    /// Registers a WebSocket endpoint. `handle_ws_control_frames` opts the
    /// handler in to receiving ping/close frames itself instead of having
    /// the engine answer them automatically (see [`crate::ws`]).
    pub fn register_ws_handler<F, Fut>(
        mut self,
        uri: &str,
        handle_ws_control_frames: bool,
        handler: F,
    ) -> Result<Self, RegisterError>
    where
        F: Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Fut + 'static,
        Fut: Future<Output = Handled> + 'static,
    {
        let mut registration = boxed_registration(Method::Get, uri, None, handler);
        registration.is_websocket = true;
        registration.handle_ws_control_frames = handle_ws_control_frames;
        self.handlers.register(registration)?;
        Ok(self)
    }

    pub fn unregister_uri_handler(mut self, method: Method, uri: &str) -> Self {
        self.handlers.unregister(method, uri.as_bytes());
        self
    }

    pub fn unregister_uri(mut self, uri: &str) -> Self {
        self.handlers.unregister_uri(uri.as_bytes());
        self
    }

    /// Overrides the canned body the engine writes for one error outcome.
    pub fn register_err_handler<F>(mut self, code: ErrCode, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response) -> Handled + 'static,
    {
        self.err_handlers.register(code, Rc::new(handler));
        self
    }

    /// Finalizes configuration. Call [`Server::bind`] next to obtain a
    /// listening [`Server`].
    pub fn build(self) -> Server {
        let (control, control_handle) = control_pair();
        Server {
            server_config: Rc::new(self.server_config),
            conn_limits: self.conn_limits,
            req_limits: self.req_limits,
            resp_limits: self.resp_limits,
            ws_limits: self.ws_limits,
            handlers: Rc::new(RefCell::new(self.handlers)),
            err_handlers: Rc::new(RefCell::new(self.err_handlers)),
            listener: None,
            control,
            control_handle,
        }
    }
}

/// A configured server, not yet bound to a socket.
///
/// The control plane ([`ControlHandle`]/[`ControlPlane`]) is created here
/// rather than in [`Server::launch`], so a caller can clone out a
/// [`ControlHandle`] via [`Server::control_handle`] before handing `self` to
/// `launch` (which consumes it).
pub struct Server {
    server_config: Rc<ServerConfig>,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    ws_limits: WsLimits,
    handlers: Rc<RefCell<HandlerTable>>,
    err_handlers: Rc<RefCell<ErrHandlerTable>>,
    listener: Option<TcpListener>,
    control: ControlPlane,
    control_handle: ControlHandle,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Binds the listening socket. `addr` accepts anything
    /// [`TcpListener::bind`] does (a `&str` is the common case).
    pub async fn bind<A: tokio::net::ToSocketAddrs>(mut self, addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        self.listener = Some(listener);
        Ok(self)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .expect("Server::bind must be called before Server::local_addr")
            .local_addr()
    }

    /// Returns a cloneable, thread-safe handle for `stop`/`queue_work`. Must
    /// be called before [`launch`](Self::launch), which consumes `self`.
    pub fn control_handle(&self) -> ControlHandle {
        self.control_handle.clone()
    }

    /// Runs the accept loop until [`ControlHandle::stop`] is called.
    pub async fn launch(self) {
        #[track_caller]
        fn expect_listener(listener: Option<TcpListener>) -> TcpListener {
            listener.expect("The `bind` method must be called before `launch`")
        }

        let listener = expect_listener(self.listener);

        let table = Rc::new(RefCell::new(SessionTable::new(
            self.server_config.max_open_sockets,
            self.server_config.lru_purge_enable,
        )));

        let accept_loop = AcceptLoop {
            listener,
            server_config: self.server_config,
            conn_limits: self.conn_limits,
            req_limits: self.req_limits,
            resp_limits: self.resp_limits,
            ws_limits: self.ws_limits,
            table,
            handlers: self.handlers,
            err_handlers: self.err_handlers,
            control: self.control,
        };

        let local = tokio::task::LocalSet::new();
        local.run_until(accept_loop.run()).await;
    }
}

