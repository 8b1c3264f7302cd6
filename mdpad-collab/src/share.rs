//! Document identifiers and endpoint addresses.
//!
//! An id looks like `66f1a2b3_Xy3kQz`: the unix time at which the document
//! may be discarded, in hex, followed by a random key. The session treats
//! ids as opaque; only the server and link sharing care about the layout.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::protocol::ProtocolError;

/// Lifetime of a document when a link does not ask for one.
pub const DEFAULT_EXPIRE_SECS: u64 = 86_400;

/// Length of the random part of a document id.
pub const KEY_LEN: usize = 6;

/// Path prefix of the document socket endpoint.
pub const SOCKET_PATH: &str = "/api/socket/";

/// A fresh id for a document that expires `expire_secs` from now.
pub fn generate_document_id(expire_secs: u64) -> String {
    let key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect();
    document_id(unix_now().saturating_add(expire_secs), &key)
}

/// Compose an id from its expiry timestamp and key.
pub fn document_id(expires_at: u64, key: &str) -> String {
    format!("{expires_at:x}_{key}")
}

/// Expiry timestamp encoded in an id, if it has one.
pub fn expires_at(document_id: &str) -> Option<u64> {
    let (stamp, key) = document_id.split_once('_')?;
    if key.is_empty() {
        return None;
    }
    u64::from_str_radix(stamp, 16).ok()
}

/// Read `expire=<secs>` from a link's query string, falling back to
/// [`DEFAULT_EXPIRE_SECS`].
pub fn expire_from_query(query: &str) -> u64 {
    query
        .trim_start_matches('?')
        .split('&')
        .find_map(|pair| pair.strip_prefix("expire="))
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_EXPIRE_SECS)
}

/// WebSocket endpoint for `document_id` on the server at `origin`.
///
/// `https://host` maps to `wss://host/api/socket/{id}` and `http://host` to
/// `ws://…`; `ws`/`wss` origins are kept as they are.
pub fn socket_uri(origin: &str, document_id: &str) -> Result<String, ProtocolError> {
    let (scheme, rest) = origin
        .split_once("://")
        .ok_or_else(|| ProtocolError::InvalidUri(origin.to_owned()))?;
    let scheme = match scheme {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(ProtocolError::InvalidUri(origin.to_owned())),
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(ProtocolError::InvalidUri(origin.to_owned()));
    }
    Ok(format!("{scheme}://{host}{SOCKET_PATH}{document_id}"))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
