//! kiln_httpd - embedded-grade HTTP/1.1 server with WebSocket upgrade
//!
//! A single-threaded, fixed-capacity HTTP server built around a
//! `current_thread` tokio runtime and one `LocalSet`: every session's state
//! lives on the task that owns it, registration tables and limits are
//! pre-sized at startup, and nothing allocates once the server is running.
//! Modeled on `esp_http_server`'s resource discipline, reimplemented for a
//! `tokio`-based host instead of a single-core microcontroller.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked request/response bodies.
//! - **WebSocket upgrade**: RFC 6455 handshake and framing on any registered
//!   URI, with the engine answering ping/close automatically unless the
//!   handler opts in to handling control frames itself.
//!
//! # Features
//!
//! ## Resource discipline
//! - **Fixed-capacity everywhere** - the session table, the URI handler
//!   table, and per-session scratch buffers are all sized once at startup.
//! - **LRU eviction under pressure** - an idle session's slot is recycled for
//!   a new connection rather than refusing it outright, if
//!   [`ServerConfig::lru_purge_enable`](config::ServerConfig::lru_purge_enable) is set.
//! - **Per-request limits** - URL length, header count/size, and body size
//!   are all bounded; violations become canned `4xx` responses rather than
//!   unbounded reads.
//!
//! ## Control from outside the engine
//! - **[`ControlHandle`]** - a cloneable, `Send` handle for signaling
//!   shutdown or queuing handler registration from another OS thread, since
//!   the engine itself never leaves its own `current_thread` runtime.
//! - **Per-session context** - [`SessionContext`] lets a handler stash and
//!   retrieve arbitrary per-connection state across requests on the same
//!   connection.
//! - **Custom error bodies** - [`ErrCode`] overrides via
//!   `register_err_handler`, in place of the engine's canned responses.
//!
//! # Quick Start
//!
//! ```no_run
//! use kiln_httpd::{Server, StatusCode};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     Server::builder()
//!         .register_uri_handler(kiln_httpd::Method::Get, "/", |_req, resp, _ctx| async move {
//!             resp.status(StatusCode::Ok).body("Hello, world!")
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
//!
//! See [`config`] for tuning session, request, response, and connection
//! limits.
pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod tokenizer;
    pub(crate) mod types;

    pub(crate) use types::Version;
}
pub(crate) mod engine {
    pub(crate) mod accept;
    pub(crate) mod control;
    pub(crate) mod dispatch;
}
pub(crate) mod server {
    pub(crate) mod builder;
}
pub(crate) mod codec {
    pub(crate) mod base64;
    pub(crate) mod sha1;
}
pub(crate) mod sync {
    pub(crate) mod event_group;
}
pub(crate) mod uri {
    pub(crate) mod handlers;
    pub(crate) mod matcher;
}
pub(crate) mod ws {
    pub(crate) mod frame;
    pub(crate) mod handshake;
}
pub(crate) mod session {
    pub(crate) mod table;
}
pub(crate) mod errors;
pub mod config;

pub use crate::{
    engine::control::{ClientInfo, ControlHandle, EngineContext},
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    server::builder::{Server, ServerBuilder},
    uri::handlers::{ErrCode, RegisterError, SessionContext, WsMessage},
    ws::frame::Opcode,
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::config::ReqLimits::default()),
        &mut Response::new(&crate::config::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use kiln_httpd::{Handled, Request, Response, StatusCode};
        struct $name;

        impl $name {
            async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
