//! Listener readiness loop: accept, admit, configure the socket, spawn.
//!
//! Accepts a connection and spawns its per-connection task directly via
//! `spawn_local` — there is only ever one worker here, the engine's own
//! `LocalSet`.

use crate::{
    config::{ConnLimits, ReqLimits, RespLimits, ServerConfig, WsLimits},
    engine::{
        control::{ControlPlane, EngineContext},
        dispatch,
    },
    session::table::{AdmissionError, SessionTable},
    uri::handlers::{ErrHandlerTable, HandlerTable},
};
use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};
use tokio::net::TcpListener;

pub(crate) struct AcceptLoop {
    pub(crate) listener: TcpListener,
    pub(crate) server_config: Rc<ServerConfig>,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) ws_limits: WsLimits,
    pub(crate) table: Rc<RefCell<SessionTable>>,
    pub(crate) handlers: Rc<RefCell<HandlerTable>>,
    pub(crate) err_handlers: Rc<RefCell<ErrHandlerTable>>,
    pub(crate) control: ControlPlane,
}

impl AcceptLoop {
    /// Runs until a `stop` signal is observed. Every iteration races a fresh
    /// `accept()` against the control plane's event group so `stop` is never
    /// delayed behind a slow-arriving connection.
    pub(crate) async fn run(self) {
        let AcceptLoop {
            listener,
            server_config,
            conn_limits,
            req_limits,
            resp_limits,
            ws_limits,
            table,
            handlers,
            err_handlers,
            control,
        } = self;

        loop {
            if control.stop_requested() {
                break;
            }

            let ctx = EngineContext { table: &table, handlers: &handlers, err_handlers: &err_handlers };
            control.drain(&ctx);

            tokio::select! {
                biased;

                _ = control.events.wait(super::control::STOP_BIT, false, false, Some(Duration::from_millis(100))) => {
                    continue;
                }

                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else { continue };
                    self_admit(
                        stream,
                        peer_addr,
                        &server_config,
                        &conn_limits,
                        &req_limits,
                        &resp_limits,
                        &ws_limits,
                        &table,
                        &handlers,
                        &err_handlers,
                    );
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn self_admit(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    server_config: &Rc<ServerConfig>,
    conn_limits: &ConnLimits,
    req_limits: &ReqLimits,
    resp_limits: &RespLimits,
    ws_limits: &WsLimits,
    table: &Rc<RefCell<SessionTable>>,
    handlers: &Rc<RefCell<HandlerTable>>,
    err_handlers: &Rc<RefCell<ErrHandlerTable>>,
) {
    let admitted = table.borrow_mut().admit(peer_addr);

    let admitted = match admitted {
        Ok(admitted) => admitted,
        Err(AdmissionError::Full) => {
            tracing::warn!(%peer_addr, "refusing connection: session table full");
            return;
        }
    };

    if let Some(evicted) = admitted.evicted {
        tracing::debug!(%evicted, new = %peer_addr, "evicted idle session to admit new connection");
    }

    if let Some(open_fn) = &server_config.open_fn {
        if !open_fn(peer_addr) {
            tracing::debug!(%peer_addr, "open_fn refused connection");
            table.borrow_mut().remove_if_current(admitted.index, &admitted.handle);
            return;
        }
    }

    if let Err(error) = configure_socket(&stream, server_config) {
        tracing::warn!(%peer_addr, %error, "failed to apply socket options");
    }

    tracing::debug!(%peer_addr, index = admitted.index, "accepted connection");

    tokio::task::spawn_local(dispatch::run(
        stream,
        admitted.index,
        admitted.handle,
        Rc::clone(table),
        Rc::clone(handlers),
        Rc::clone(err_handlers),
        conn_limits.clone(),
        req_limits.clone(),
        resp_limits.clone(),
        ws_limits.clone(),
        Rc::clone(server_config),
    ));
}

fn configure_socket(stream: &tokio::net::TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    if let Some(keep_alive) = &config.keep_alive {
        let params = socket2::TcpKeepalive::new()
            .with_time(keep_alive.idle)
            .with_interval(keep_alive.interval);
        #[cfg(not(any(target_os = "windows", target_os = "openbsd")))]
        let params = params.with_retries(keep_alive.count);
        sock_ref.set_tcp_keepalive(&params)?;
    }

    if let Some(linger) = config.so_linger {
        sock_ref.set_linger(Some(linger))?;
    }

    stream.set_nodelay(true)?;
    Ok(())
}
