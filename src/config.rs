//! Server configuration: socket admission policy, timeouts, and buffer sizing.
//!
//! # Memory Consumption
//!
//! Each active session consumes memory according to:
//!
//! `Total` = [`Request Buffer`](ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](RespLimits#buffer-management) +
//!           session-table bookkeeping.
//!
//! See each component's documentation for details and configuration options.
//!
//! # Examples
//!
//! ```no_run
//! use kiln_httpd::{config::{ServerConfig, ReqLimits}, Method, Server, StatusCode};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     Server::builder()
//!         .server_config(ServerConfig {
//!             max_open_sockets: 16,
//!             lru_purge_enable: true,
//!             ..ServerConfig::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 24,
//!             body_size: 16 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .register_uri_handler(Method::Get, "/", |_req, resp, _ctx| async move {
//!             resp.status(StatusCode::Ok).body("Hello world!")
//!         })
//!         .unwrap()
//!         .build()
//!         .bind("127.0.0.1:8080")
//!         .await
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```

use std::{fmt, net::SocketAddr, rc::Rc, time::Duration};

/// Fires once a connection is admitted into the session table, before the
/// socket is configured or its dispatch task spawned. Returning `false`
/// closes the connection immediately instead of dispatching it.
pub type OpenFn = Rc<dyn Fn(SocketAddr) -> bool>;

/// Fires once a session's dispatch loop tears down, whether it closed
/// cleanly, was evicted, or faulted.
pub type CloseFn = Rc<dyn Fn(SocketAddr)>;

/// Engine-wide admission policy, timeouts, and socket-level knobs.
///
/// Corresponds to the config record of the public API surface: everything
/// that is decided once, before `start`, and never mutated afterwards.
#[derive(Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrently open session slots (default: `64`).
    ///
    /// The engine is single-threaded and keeps a fixed-capacity session
    /// table of this size; once full, admission falls to LRU eviction
    /// (if [`lru_purge_enable`](Self::lru_purge_enable)) or immediate refusal.
    pub max_open_sockets: usize,

    /// Maximum number of registered URI handlers (default: `32`).
    pub max_uri_handlers: usize,

    /// Maximum number of headers staged on an outgoing response (default: `16`).
    pub max_resp_headers: usize,

    /// TCP listen backlog (default: `16`).
    pub backlog_conn: u32,

    /// When the session table is full, evict the least-recently-used
    /// *idle* session to admit a new one instead of refusing it (default: `true`).
    ///
    /// A session mid-request (parsing or inside a handler) is never a
    /// candidate regardless of its LRU rank — see [`session::table`](crate::session::table).
    pub lru_purge_enable: bool,

    /// How long a session may sit with no bytes available before it is
    /// treated as a `408 Request Timeout` (default: `5 seconds`).
    pub recv_wait_timeout: Duration,

    /// How long a single write may block before the connection is torn
    /// down as a hard I/O error (default: `5 seconds`).
    pub send_wait_timeout: Duration,

    /// TCP keepalive probing, applied via `socket2` after accept (default: `None`).
    pub keep_alive: Option<KeepAliveConfig>,

    /// `SO_LINGER` timeout applied via `socket2` after accept (default: `None`).
    pub so_linger: Option<Duration>,

    /// Emit structured JSON bodies on canned error pages rather than empty
    /// bodies (default: `true`).
    pub json_errors: bool,

    /// Runs on admission, before the socket is configured or dispatched;
    /// returning `false` closes the connection immediately (default: `None`).
    pub open_fn: Option<OpenFn>,

    /// Runs once a session's dispatch loop has torn down (default: `None`).
    pub close_fn: Option<CloseFn>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_open_sockets", &self.max_open_sockets)
            .field("max_uri_handlers", &self.max_uri_handlers)
            .field("max_resp_headers", &self.max_resp_headers)
            .field("backlog_conn", &self.backlog_conn)
            .field("lru_purge_enable", &self.lru_purge_enable)
            .field("recv_wait_timeout", &self.recv_wait_timeout)
            .field("send_wait_timeout", &self.send_wait_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("so_linger", &self.so_linger)
            .field("json_errors", &self.json_errors)
            .field("open_fn", &self.open_fn.as_ref().map(|_| "<fn>"))
            .field("close_fn", &self.close_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_open_sockets: 64,
            max_uri_handlers: 32,
            max_resp_headers: 16,
            backlog_conn: 16,
            lru_purge_enable: true,
            recv_wait_timeout: Duration::from_secs(5),
            send_wait_timeout: Duration::from_secs(5),
            keep_alive: None,
            so_linger: None,
            json_errors: true,
            open_fn: None,
            close_fn: None,

            _priv: (),
        }
    }
}

/// TCP keepalive probe cadence, applied to accepted sockets via `socket2`.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Number of unanswered probes before the peer is considered dead.
    pub count: u32,
}

/// Connection-level limits independent of buffer sizing.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum number of requests allowed per connection (default: `1_000`).
    ///
    /// Connection closes (with `Connection: close`) after processing this
    /// many requests, bounding worst-case per-connection memory churn.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of a connection from accept to close (default: `10 minutes`).
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            max_requests_per_connection: 1_000,
            connection_lifetime: Duration::from_secs(600),
            _priv: (),
        }
    }
}

/// HTTP request parsing limits and scratch-buffer pre-allocation strategy.
///
/// # Memory Allocation Strategy
///
/// Each session pre-allocates a fixed-size scratch buffer sized from these
/// limits:
///
/// ```text
/// Total Buffer = First Line + (Headers × Header Line) + Body + Overhead
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum URL length in bytes including path and query string (default: `256`).
    pub url_size: usize,
    /// Maximum query string length in bytes (default: `128`).
    pub url_query_size: usize,
    /// Maximum number of query parameters (default: `8`).
    pub url_query_parts: usize,

    /// Maximum number of headers per request (default: `16`).
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64`).
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `512`).
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `4 KiB`).
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 256,
            url_query_size: 128,
            url_query_parts: 8,

            header_count: 16,
            header_name_size: 64,
            header_value_size: 512,

            body_size: 4 * 1024,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the estimated scratch-buffer size required per session.
    #[inline(always)]
    pub fn estimated_buffer_size(self) -> usize {
        self.precalculate().precalc.buffer
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.h_line = self.h_line();
        self.precalc.buffer = self.buffer();

        self
    }

    #[inline(always)]
    // First line + Header * N + "\r\n" + Body
    fn buffer(&self) -> usize {
        self.precalc.first_line + self.header_count * self.precalc.h_line + 2 + self.body_size
    }

    #[inline(always)]
    // OPTIONS /url/test HTTP/1.1\r\n
    // |-----| |-------| |------|
    //  Method    URL     Version
    //
    // Formula: Method(7, longest: OPTIONS) + " " + url + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Authorization: Sample%20Data\r\n
    // |-----------|  |-----------|
    //     Name           Value
    //
    // Formula: Name + ": " + Value + "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) buffer: usize,
    pub(crate) first_line: usize,
    pub(crate) h_line: usize,
}

/// Configuration for response processing and memory allocation limits.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for responses (default: `1024 B`).
    pub default_capacity: usize,
    /// Maximum allowed buffer capacity kept around between requests (default: `8192 B`).
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,

            _priv: (),
        }
    }
}

/// WebSocket-specific limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Maximum frame payload length accepted from a peer (default: `64 KiB`).
    ///
    /// Frames whose declared length exceeds this are rejected before any
    /// payload bytes are read, so an attacker cannot force allocation of an
    /// arbitrarily large buffer via the length prefix alone.
    pub max_frame_len: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_frame_len: 64 * 1024,
            _priv: (),
        }
    }
}
