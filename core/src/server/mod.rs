//! Server-side transports (spec §5, §6): a pipe session loop and an axum
//! HTTP router, both built on top of [`crate::registry::Protocol`] and the
//! [`crate::dispatch`] functions.

pub mod http;
pub mod pipe;

use base64::Engine;
use rand::RngCore;

/// Generate the per-process `server_id` stamped onto every response batch
/// (spec §4.1). Random rather than derived from hostname/pid: callers that
/// care about stable identity should set one explicitly via
/// [`pipe::PipeServer::with_server_id`] / [`http::HttpServerConfig::server_id`].
pub fn random_server_id() -> String {
    let mut bytes = [0u8; 9];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
