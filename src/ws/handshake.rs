//! WebSocket upgrade handshake (RFC 6455 section 1.3 / 4.2).

use crate::{codec, Method, Request};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Returns `true` if `request` carries the header set required to upgrade
/// to WebSocket: `Upgrade: websocket`, `Connection: Upgrade`,
/// `Sec-WebSocket-Version: 13`, and a non-empty `Sec-WebSocket-Key`, on a
/// `GET` request.
pub(crate) fn is_upgrade_request(request: &Request) -> bool {
    request.method() == Method::Get
        && header_contains_token(request, b"upgrade", b"websocket")
        && header_contains_token(request, b"connection", b"upgrade")
        && request.header(b"sec-websocket-version") == Some(b"13")
        && request
            .header(b"sec-websocket-key")
            .is_some_and(|key| !key.is_empty())
}

/// Derives `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub(crate) fn accept_key(client_key: &[u8]) -> String {
    let mut buf = Vec::with_capacity(client_key.len() + GUID.len());
    buf.extend_from_slice(client_key);
    buf.extend_from_slice(GUID);
    codec::base64::encode(&codec::sha1::digest(&buf))
}

/// Picks the first client-offered subprotocol the handler supports, per the
/// comma-separated `Sec-WebSocket-Protocol` request header, if any.
pub(crate) fn negotiate_subprotocol(request: &Request, supported: &[&str]) -> Option<String> {
    let offered = request.header(b"sec-websocket-protocol")?;
    let offered = std::str::from_utf8(offered).ok()?;

    offered
        .split(',')
        .map(str::trim)
        .find(|candidate| supported.iter().any(|s| s.eq_ignore_ascii_case(candidate)))
        .map(str::to_owned)
}

/// Checks whether a comma-separated header value contains `token`
/// (case-insensitively, ignoring surrounding whitespace on each item).
fn header_contains_token(request: &Request, name: &[u8], token: &[u8]) -> bool {
    let Some(value) = request.header(name) else {
        return false;
    };

    value
        .split(|&b| b == b',')
        .map(|item| trim_ascii(item))
        .any(|item| item.eq_ignore_ascii_case(token))
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn rfc_6455_worked_example() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn trims_and_lowercases_tokens() {
        assert_eq!(str_op(trim_ascii(b"  Upgrade  ")), "Upgrade");
        assert!(trim_ascii(b"").is_empty());
    }

    #[test]
    fn subprotocol_negotiation_picks_first_shared_one() {
        crate::run_test(|req, resp| {
            let chosen = negotiate_subprotocol(req, &["chat", "superchat"]);
            assert_eq!(chosen, None);
            resp.status(crate::StatusCode::Ok).body("")
        });
    }
}
