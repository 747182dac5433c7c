//! Client-side transports (spec §4.7): callers supply the schemas a method
//! was registered with (there is no shared in-process [`crate::registry::Protocol`]
//! across a wire boundary) and get back decoded [`crate::registry::Row`]s.

pub mod http;
pub mod pipe;

use base64::Engine;
use rand::RngCore;

/// Generate a request id for a call that doesn't supply its own (spec
/// §4.1: `request_id` is optional and purely diagnostic, so any unique
/// string works).
pub fn random_request_id() -> String {
    let mut bytes = [0u8; 9];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
