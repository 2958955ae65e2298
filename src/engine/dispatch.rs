//! Per-connection request loop: read, parse, match, invoke, write.
//!
//! Fills the tokenizer, parses, calls the handler, writes the response, and
//! loops on keep-alive, owning its state directly — socket, tokenizer, request,
//! response all live on this task's stack — and only reaches into the
//! shared [`SessionTable`] for the lightweight [`SessionHandle`] that backs
//! LRU eviction and `sess_get_ctx`/`sess_set_ctx`/`get_client_list`.

use crate::{
    config::{ConnLimits, ReqLimits, RespLimits, ServerConfig, WsLimits},
    errors::ErrorKind,
    http::{
        request::{ParseError, RequestParser},
        tokenizer::Tokenizer,
    },
    session::table::{SessionHandle, SessionTable},
    uri::handlers::{ErrCode, ErrHandlerTable, HandlerTable, Lookup, SessionContext, WsMessage},
    ws::{
        frame::{self, Opcode},
        handshake,
    },
    Request, Response, StatusCode, Version,
};
use std::{cell::RefCell, io, rc::Rc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};

/// Per-connection resources the dispatch task owns outright. Only
/// `handle`/`index` ever cross paths with the shared table.
pub(crate) struct Connection {
    stream: TcpStream,
    tokenizer: Tokenizer,
    request: Request,
    response: Response,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    ws_limits: WsLimits,
    request_count: usize,
    created: Instant,
    handle_ws_control_frames: bool,
    send_wait_timeout: Duration,
}

impl Connection {
    async fn send_ws_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        WsSender { stream: &mut self.stream, timeout: self.send_wait_timeout }
            .send(fin, opcode, payload)
            .await
    }
}

/// The write half of a websocket connection, handed to a handler through
/// [`SessionContext::ws_send_frame`](crate::uri::handlers::SessionContext::ws_send_frame)
/// so it can push frames of its own instead of only returning a body.
pub(crate) struct WsSender<'a> {
    stream: &'a mut TcpStream,
    timeout: Duration,
}

impl WsSender<'_> {
    pub(crate) async fn send(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        let bytes = frame::encode(fin, opcode, payload);
        write_with_retry(self.stream, &bytes, self.timeout).await
    }
}

/// Runs one accepted connection to completion. Always removes its slot from
/// `table` on the way out, but only if the slot still belongs to it (an
/// evicted connection's slot may already hold a different occupant).
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(peer = %handle.peer_addr, index))]
pub(crate) async fn run(
    stream: TcpStream,
    index: usize,
    handle: Rc<SessionHandle>,
    table: Rc<RefCell<SessionTable>>,
    handlers: Rc<RefCell<HandlerTable>>,
    err_handlers: Rc<RefCell<ErrHandlerTable>>,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    ws_limits: WsLimits,
    server_config: Rc<ServerConfig>,
) {
    let req_limits = req_limits.precalculate();
    let mut conn = Connection {
        tokenizer: Tokenizer::new(&req_limits),
        request: Request::new(&req_limits),
        response: Response::new(&resp_limits),
        stream,
        req_limits,
        resp_limits,
        ws_limits,
        request_count: 0,
        created: Instant::now(),
        handle_ws_control_frames: false,
        send_wait_timeout: server_config.send_wait_timeout,
    };

    loop {
        if handle.is_closing() {
            break;
        }

        match step(&mut conn, &handle, &handlers, &err_handlers, &conn_limits, &server_config).await {
            StepOutcome::Continue => {
                table.borrow_mut().bump_touch(index);
                continue;
            }
            StepOutcome::UpgradeToWebSocket => {
                handle.is_websocket.set(true);
                run_websocket(&mut conn, &handle, &handlers).await;
                break;
            }
            StepOutcome::Close => break,
        }
    }

    table.borrow_mut().remove_if_current(index, &handle);

    if let Some(close_fn) = &server_config.close_fn {
        close_fn(handle.peer_addr);
    }

    tracing::debug!("connection closed");
}

enum StepOutcome {
    Continue,
    UpgradeToWebSocket,
    Close,
}

/// One read-parse-dispatch-write cycle for a connection still speaking
/// plain HTTP.
async fn step(
    conn: &mut Connection,
    handle: &Rc<SessionHandle>,
    handlers: &Rc<RefCell<HandlerTable>>,
    err_handlers: &Rc<RefCell<ErrHandlerTable>>,
    conn_limits: &ConnLimits,
    server_config: &Rc<ServerConfig>,
) -> StepOutcome {
    if conn.request_count >= conn_limits.max_requests_per_connection
        || conn.created.elapsed() > conn_limits.connection_lifetime
    {
        return StepOutcome::Close;
    }

    handle.set_in_flight(true);
    conn.tokenizer.reset();
    conn.request.reset();

    // A request's bytes may arrive over arbitrarily many `recv` calls: keep
    // appending to the tokenizer and re-parsing from the start of its buffer
    // until the grammar is either complete or provably broken.
    let version = loop {
        match conn.tokenizer.fill_buffer(&mut conn.stream, server_config.recv_wait_timeout).await {
            Ok(0) => return StepOutcome::Close,
            Ok(_) => {}
            Err(_) => return StepOutcome::Close,
        }

        conn.request.reset();
        conn.tokenizer.position = 0;
        let mut parser = RequestParser::new(&mut conn.tokenizer, &mut conn.request, &conn.req_limits);

        match parser.parse() {
            Ok(version) => break version,
            Err(ParseError::Incomplete) => continue,
            Err(ParseError::Fatal(error)) => {
                send_error(conn, err_handlers, server_config, error).await;
                return StepOutcome::Close;
            }
        }
    };

    let lookup_is_websocket = handshake::is_upgrade_request(&conn.request)
        && matches!(
            handlers.borrow().lookup(conn.request.method(), conn.request.url().path()),
            Lookup::Found(entry) if entry.is_websocket
        );

    let outcome = if lookup_is_websocket {
        complete_handshake(conn, handle, handlers, version, server_config).await
    } else {
        dispatch_plain(conn, handle, handlers, err_handlers, server_config).await
    };

    handle.set_in_flight(false);
    outcome
}

async fn complete_handshake(
    conn: &mut Connection,
    handle: &Rc<SessionHandle>,
    handlers: &Rc<RefCell<HandlerTable>>,
    version: Version,
    server_config: &Rc<ServerConfig>,
) -> StepOutcome {
    let key = conn.request.header(b"sec-websocket-key").unwrap_or(b"");
    let accept = handshake::accept_key(key);

    conn.response.reset(&conn.resp_limits);
    conn.response.version = version;
    conn.response
        .status(StatusCode::SwitchingProtocols)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept)
        .body("");

    let written = write_with_retry(&mut conn.stream, conn.response.buffer(), server_config.send_wait_timeout).await;
    let Ok(()) = written else {
        return StepOutcome::Close;
    };

    let entry_control_frames = match handlers.borrow().lookup(conn.request.method(), conn.request.url().path()) {
        Lookup::Found(entry) => entry.handle_ws_control_frames,
        _ => false,
    };
    conn.handle_ws_control_frames = entry_control_frames;

    tracing::debug!("upgraded to websocket");
    invoke_ws_handler(conn, handle, handlers, None).await;
    StepOutcome::UpgradeToWebSocket
}

async fn dispatch_plain(
    conn: &mut Connection,
    handle: &Rc<SessionHandle>,
    handlers: &Rc<RefCell<HandlerTable>>,
    err_handlers: &Rc<RefCell<ErrHandlerTable>>,
    server_config: &Rc<ServerConfig>,
) -> StepOutcome {
    conn.response.reset(&conn.resp_limits);
    conn.response.version = conn.request.version();

    let lookup_error = match handlers.borrow().lookup(conn.request.method(), conn.request.url().path()) {
        Lookup::Found(_) => None,
        Lookup::MethodMismatch => Some(ErrorKind::MethodNotAllowed),
        Lookup::NoMatch => Some(ErrorKind::NotFound),
    };

    if let Some(error) = lookup_error {
        send_error(conn, err_handlers, server_config, error).await;
        return StepOutcome::Close;
    }

    invoke_handler(conn, handle, handlers).await;

    let keep_alive = conn.response.keep_alive;
    conn.request_count += 1;

    let written = write_with_retry(&mut conn.stream, conn.response.buffer(), server_config.send_wait_timeout).await;

    match written {
        Ok(()) if keep_alive => StepOutcome::Continue,
        _ => StepOutcome::Close,
    }
}

async fn invoke_handler(conn: &mut Connection, handle: &Rc<SessionHandle>, handlers: &Rc<RefCell<HandlerTable>>) {
    let found = handlers
        .borrow()
        .lookup(conn.request.method(), conn.request.url().path());
    let Lookup::Found(entry) = found else { return };
    let handler = Rc::clone(&entry.handler);

    let mut ctx = SessionContext::new(handle);
    handler(&conn.request, &mut conn.response, &mut ctx).await;
}

/// Looks up and invokes the handler for a websocket-upgraded connection,
/// handing it the inbound frame (if any, `None` for the handshake's "opened"
/// call) and a [`WsSender`] so it can push frames of its own.
async fn invoke_ws_handler(
    conn: &mut Connection,
    handle: &Rc<SessionHandle>,
    handlers: &Rc<RefCell<HandlerTable>>,
    message: Option<WsMessage<'_>>,
) {
    let found = handlers
        .borrow()
        .lookup(conn.request.method(), conn.request.url().path());
    let Lookup::Found(entry) = found else { return };
    let handler = Rc::clone(&entry.handler);

    let timeout = conn.send_wait_timeout;
    let Connection { request, response, stream, .. } = conn;
    let sender = WsSender { stream, timeout };
    let mut ctx = SessionContext::new_websocket(handle, sender, message);
    handler(request, response, &mut ctx).await;
}

async fn send_error(
    conn: &mut Connection,
    err_handlers: &Rc<RefCell<ErrHandlerTable>>,
    server_config: &Rc<ServerConfig>,
    error: ErrorKind,
) {
    tracing::debug!(?error, "sending error response");

    let custom = ErrCode::from_kind(&error).and_then(|code| {
        err_handlers.borrow().get(code).map(Rc::clone)
    });

    let Some(handler) = custom else {
        let version = conn.request.version();
        let body = error.as_http(version, server_config.json_errors);
        let _ = write_with_retry(&mut conn.stream, body, server_config.send_wait_timeout).await;
        return;
    };

    conn.response.reset(&conn.resp_limits);
    conn.response.version = conn.request.version();
    handler(&conn.request, &mut conn.response);
    let _ = write_with_retry(&mut conn.stream, conn.response.buffer(), server_config.send_wait_timeout).await;
}

/// Writes `bytes` to `stream`, looping on partial writes until every byte is
/// out or a hard error (including a full `timeout` elapsing with no
/// forward progress) ends the attempt.
async fn write_with_retry(stream: &mut TcpStream, bytes: &[u8], timeout: Duration) -> io::Result<()> {
    let mut written = 0;

    while written < bytes.len() {
        let attempt = tokio::select! {
            biased;
            result = stream.write(&bytes[written..]) => result,
            _ = tokio::time::sleep(timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
            }
        };

        match attempt {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed during write")),
            Ok(n) => written += n,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Frame loop taken once a session has upgraded. Control frames are
/// auto-handled unless the registered entry opted in to receiving them.
async fn run_websocket(conn: &mut Connection, handle: &Rc<SessionHandle>, handlers: &Rc<RefCell<HandlerTable>>) {
    loop {
        if handle.is_closing() {
            let _ = conn.send_ws_frame(true, Opcode::Close, &[]).await;
            return;
        }

        handle.set_in_flight(false);
        let Some(frame::Frame { fin, opcode, payload }) = read_frame(conn).await else {
            return;
        };
        handle.set_in_flight(true);

        if opcode.is_control() && !conn.handle_ws_control_frames {
            match opcode {
                Opcode::Ping => {
                    let _ = conn.send_ws_frame(true, Opcode::Pong, &payload).await;
                }
                Opcode::Close => {
                    let _ = conn.send_ws_frame(true, Opcode::Close, &payload).await;
                    return;
                }
                _ => {}
            }
            continue;
        }

        conn.response.reset(&conn.resp_limits);
        let message = WsMessage { fin, opcode, payload: &payload };
        invoke_ws_handler(conn, handle, handlers, Some(message)).await;

        if opcode == Opcode::Close {
            return;
        }
    }
}

async fn read_frame(conn: &mut Connection) -> Option<frame::Frame> {
    let mut header_buf = Vec::with_capacity(14);

    loop {
        match frame::parse_header(&header_buf) {
            Ok(Some(header)) => {
                if header.payload_len > conn.ws_limits.max_frame_len {
                    return None;
                }

                let extra = header.header_len + if header.masked { 4 } else { 0 };
                if header_buf.len() < extra {
                    read_more(conn, &mut header_buf).await?;
                    continue;
                }

                let mask = header.masked.then(|| {
                    let mut m = [0u8; 4];
                    m.copy_from_slice(&header_buf[header.header_len..header.header_len + 4]);
                    m
                });

                let mut payload = vec![0u8; header.payload_len as usize];
                let already = header_buf.len().saturating_sub(extra).min(payload.len());
                payload[..already].copy_from_slice(&header_buf[extra..extra + already]);

                let mut filled = already;
                while filled < payload.len() {
                    filled += read_into(conn, &mut payload[filled..]).await?;
                }

                if let Some(mask) = mask {
                    frame::unmask(&mut payload, mask);
                }

                return Some(frame::Frame::new(header.fin, header.opcode, payload));
            }
            Ok(None) => read_more(conn, &mut header_buf).await?,
            Err(_) => return None,
        }
    }
}

async fn read_more(conn: &mut Connection, buf: &mut Vec<u8>) -> Option<()> {
    let mut byte = [0u8; 1];
    let n = read_into(conn, &mut byte).await?;
    if n == 0 {
        return None;
    }
    buf.push(byte[0]);
    Some(())
}

async fn read_into(conn: &mut Connection, buf: &mut [u8]) -> Option<usize> {
    conn.stream.read(buf).await.ok().filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{uri::handlers::Registration, Handled, Method};
    use std::{future::Future, net::Ipv4Addr, pin::Pin};
    use tokio::net::{TcpListener, TcpStream};

    fn test_limits() -> (ReqLimits, RespLimits, ConnLimits, WsLimits, Rc<ServerConfig>) {
        (
            ReqLimits::default().precalculate(),
            RespLimits::default(),
            ConnLimits::default(),
            WsLimits::default(),
            Rc::new(ServerConfig::default()),
        )
    }

    fn build_connection(
        stream: TcpStream,
        req_limits: &ReqLimits,
        resp_limits: &RespLimits,
        ws_limits: &WsLimits,
        server_config: &ServerConfig,
    ) -> Connection {
        Connection {
            tokenizer: Tokenizer::new(req_limits),
            request: Request::new(req_limits),
            response: Response::new(resp_limits),
            stream,
            req_limits: req_limits.clone(),
            resp_limits: resp_limits.clone(),
            ws_limits: ws_limits.clone(),
            request_count: 0,
            created: Instant::now(),
            handle_ws_control_frames: false,
            send_wait_timeout: server_config.send_wait_timeout,
        }
    }

    /// A request whose headers arrive over two separate writes must still
    /// assemble correctly instead of being judged on the first read alone.
    #[tokio::test]
    async fn request_split_across_two_reads_still_assembles() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\nHost").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b": example\r\n\r\n").await.unwrap();

            let mut response = [0u8; 256];
            let n = stream.read(&mut response).await.unwrap();
            response[..n].to_vec()
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let (req_limits, resp_limits, conn_limits, ws_limits, server_config) = test_limits();
        let mut conn = build_connection(stream, &req_limits, &resp_limits, &ws_limits, &server_config);

        let mut table = SessionTable::new(1, false);
        let handle = table.admit(peer).ok().unwrap().handle;

        let mut handler_table = HandlerTable::new(4);
        handler_table
            .register(Registration {
                method: Method::Get,
                uri: b"/".as_slice().into(),
                custom_matcher: None,
                handler: Rc::new(|_req, resp, _ctx| {
                    Box::pin(async move { resp.status(StatusCode::Ok).body("hi") })
                        as Pin<Box<dyn Future<Output = Handled> + '_>>
                }),
                is_websocket: false,
                handle_ws_control_frames: false,
            })
            .unwrap();
        let handlers = Rc::new(RefCell::new(handler_table));
        let err_handlers = Rc::new(RefCell::new(ErrHandlerTable::new()));

        let outcome = step(&mut conn, &handle, &handlers, &err_handlers, &conn_limits, &server_config).await;
        assert!(matches!(outcome, StepOutcome::Continue));

        let response = client.await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"));
    }

    /// Full websocket round trip: handshake, a masked text frame delivered to
    /// the handler through `ws_message`, echoed back via `ws_send_frame`, then
    /// the engine's automatic close handshake.
    #[tokio::test]
    async fn websocket_handler_receives_payload_and_echoes_it() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(
                    b"GET /ws HTTP/1.1\r\n\
                      Host: example\r\n\
                      Upgrade: websocket\r\n\
                      Connection: Upgrade\r\n\
                      Sec-WebSocket-Version: 13\r\n\
                      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                )
                .await
                .unwrap();

            let mut handshake_response = [0u8; 256];
            let n = stream.read(&mut handshake_response).await.unwrap();
            assert!(handshake_response[..n].starts_with(b"HTTP/1.1 101"));

            let mask = [0x11, 0x22, 0x33, 0x44];
            let mut payload = *b"hi";
            frame::unmask(&mut payload, mask);
            let mut text_frame = vec![0x81, 0x80 | payload.len() as u8];
            text_frame.extend_from_slice(&mask);
            text_frame.extend_from_slice(&payload);
            stream.write_all(&text_frame).await.unwrap();

            let mut echoed = [0u8; 16];
            let n = stream.read(&mut echoed).await.unwrap();
            let echoed = echoed[..n].to_vec();

            let close_frame = [0x88u8, 0x80, 0x00, 0x00, 0x00, 0x00];
            stream.write_all(&close_frame).await.unwrap();

            let mut close_echo = [0u8; 16];
            let n = stream.read(&mut close_echo).await.unwrap();

            (echoed, close_echo[..n].to_vec())
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let (req_limits, resp_limits, conn_limits, ws_limits, server_config) = test_limits();
        let mut conn = build_connection(stream, &req_limits, &resp_limits, &ws_limits, &server_config);

        let mut table = SessionTable::new(1, false);
        let handle = table.admit(peer).ok().unwrap().handle;

        let mut handler_table = HandlerTable::new(4);
        handler_table
            .register(Registration {
                method: Method::Get,
                uri: b"/ws".as_slice().into(),
                custom_matcher: None,
                handler: Rc::new(|_req, resp, ctx| {
                    Box::pin(async move {
                        if let Some(message) = ctx.ws_message() {
                            let opcode = message.opcode;
                            let payload = message.payload.to_vec();
                            ctx.ws_send_frame(true, opcode, &payload).await.unwrap();
                        }
                        resp.status(StatusCode::Ok).body("")
                    }) as Pin<Box<dyn Future<Output = Handled> + '_>>
                }),
                is_websocket: true,
                handle_ws_control_frames: false,
            })
            .unwrap();
        let handlers = Rc::new(RefCell::new(handler_table));
        let err_handlers = Rc::new(RefCell::new(ErrHandlerTable::new()));

        let outcome = step(&mut conn, &handle, &handlers, &err_handlers, &conn_limits, &server_config).await;
        assert!(matches!(outcome, StepOutcome::UpgradeToWebSocket));

        run_websocket(&mut conn, &handle, &handlers).await;

        let (echoed, close_echo) = client.await.unwrap();
        assert_eq!(echoed, vec![0x81, 0x02, b'h', b'i']);
        assert_eq!(close_echo, vec![0x88, 0x00]);
    }
}

