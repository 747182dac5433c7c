//! State-token codec (spec §3, §4.2).
//!
//! The HTTP transport is stateless between calls, so an in-progress
//! producer/exchange session's state — the handler's opaque continuation
//! value, plus the schemas it was pinned to on the first call — has to
//! travel back to the client and be handed back on the next call. We don't
//! trust the client to keep it honest, so the packed form is HMAC-signed and
//! carries a creation timestamp the server checks against a TTL.
//!
//! Wire layout, all integers little-endian, before base64:
//! ```text
//! u8      version (always TOKEN_VERSION)
//! u64     created_at (unix seconds)
//! u32     state_len       || state bytes
//! u32     output_schema_len || output schema IPC bytes (0 len if absent)
//! u32     input_schema_len  || input schema IPC bytes (0 len if absent)
//! [u8; 32] HMAC-SHA256 over everything preceding it
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::{TOKEN_HMAC_LEN, TOKEN_MIN_LEN, TOKEN_VERSION};
use crate::error::{Result, RpcError};
use crate::ipc::Schema;

type HmacSha256 = Hmac<Sha256>;

/// Serializes the opaque handler continuation state. The default
/// implementation is plain JSON; callers that need the wire's big-integer
/// tagging convention apply [`crate::codec::value_to_json`] themselves
/// before handing the value to [`StateToken::pack`].
pub trait StateSerializer: Send + Sync {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

#[derive(Default)]
pub struct JsonStateSerializer;

impl StateSerializer for JsonStateSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| RpcError::protocol(format!("state serialization failed: {e}")))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| RpcError::protocol(format!("state deserialization failed: {e}")))
    }
}

/// The decoded, verified contents of a state token.
#[derive(Debug, Clone)]
pub struct UnpackedToken {
    pub created_at: u64,
    pub state: serde_json::Value,
    pub output_schema: Option<Schema>,
    pub input_schema: Option<Schema>,
}

/// Signs and verifies state tokens for one server process. Each server
/// instance mints its own random HMAC key at startup (spec §4.2: tokens
/// from one process are never expected to verify against another).
pub struct TokenCodec {
    key: Vec<u8>,
    ttl: Duration,
    serializer: Box<dyn StateSerializer>,
}

impl TokenCodec {
    /// Generate a fresh random signing key and the default TTL.
    pub fn new() -> Self {
        use rand::RngCore;
        let mut key = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        TokenCodec {
            key,
            ttl: Duration::from_secs(crate::constants::DEFAULT_TOKEN_TTL_SECS),
            serializer: Box::new(JsonStateSerializer),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_serializer(mut self, serializer: Box<dyn StateSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Pack `state` (plus the schemas the session is pinned to, if any) into
    /// a base64 token.
    pub fn pack(
        &self,
        state: &serde_json::Value,
        output_schema: Option<&Schema>,
        input_schema: Option<&Schema>,
    ) -> Result<String> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RpcError::protocol(format!("system clock before epoch: {e}")))?
            .as_secs();

        let state_bytes = self.serializer.serialize(state)?;
        let output_bytes = match output_schema {
            Some(s) => s.to_ipc_bytes()?,
            None => Vec::new(),
        };
        let input_bytes = match input_schema {
            Some(s) => s.to_ipc_bytes()?,
            None => Vec::new(),
        };

        let mut buf = Vec::with_capacity(
            1 + 8 + 4 + state_bytes.len() + 4 + output_bytes.len() + 4 + input_bytes.len(),
        );
        buf.push(TOKEN_VERSION);
        buf.extend_from_slice(&created_at.to_le_bytes());
        push_framed(&mut buf, &state_bytes);
        push_framed(&mut buf, &output_bytes);
        push_framed(&mut buf, &input_bytes);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| RpcError::protocol(format!("invalid HMAC key: {e}")))?;
        mac.update(&buf);
        buf.extend_from_slice(&mac.finalize().into_bytes());
        tracing::trace!(bytes = buf.len(), created_at, "packed state token");

        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
    }

    /// Verify and unpack a token. Checks the HMAC before trusting any other
    /// field, then the TTL (spec §4.2, §7: a forged or expired token is a
    /// `ProtocolError`, never silently accepted).
    pub fn unpack(&self, token_b64: &str) -> Result<UnpackedToken> {
        let buf = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token_b64)
            .map_err(|e| RpcError::protocol(format!("malformed state token base64: {e}")))?;

        if buf.len() < TOKEN_MIN_LEN {
            return Err(RpcError::protocol("state token too short"));
        }
        let (body, tag) = buf.split_at(buf.len() - TOKEN_HMAC_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| RpcError::protocol(format!("invalid HMAC key: {e}")))?;
        mac.update(body);
        match mac.verify_slice(tag) {
            Ok(()) => tracing::trace!("state token HMAC verified"),
            Err(_) => {
                tracing::debug!("state token HMAC verification failed");
                return Err(RpcError::protocol("HMAC verification failed"));
            }
        }

        let mut cursor = 0usize;
        let version = read_u8(body, &mut cursor)?;
        if version != TOKEN_VERSION {
            return Err(RpcError::protocol(format!(
                "unsupported state token version {version}"
            )));
        }
        let created_at = u64::from_le_bytes(read_slice(body, &mut cursor, 8)?.try_into().unwrap());

        if self.ttl > Duration::ZERO {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| RpcError::protocol(format!("system clock before epoch: {e}")))?
                .as_secs();
            let age = now.saturating_sub(created_at);
            if age > self.ttl.as_secs() {
                tracing::debug!(age, ttl = self.ttl.as_secs(), "state token expired");
                return Err(RpcError::protocol("state token expired"));
            }
        }

        let state_bytes = read_framed(body, &mut cursor)?;
        let output_bytes = read_framed(body, &mut cursor)?;
        let input_bytes = read_framed(body, &mut cursor)?;

        let state = self.serializer.deserialize(state_bytes)?;
        let output_schema = if output_bytes.is_empty() {
            None
        } else {
            Some(Schema::from_ipc_bytes(output_bytes)?)
        };
        let input_schema = if input_bytes.is_empty() {
            None
        } else {
            Some(Schema::from_ipc_bytes(input_bytes)?)
        };

        Ok(UnpackedToken {
            created_at,
            state,
            output_schema,
            input_schema,
        })
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        TokenCodec::new()
    }
}

fn push_framed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    let b = *bytes
        .get(*cursor)
        .ok_or_else(|| RpcError::protocol("truncated state token"))?;
    *cursor += 1;
    Ok(b)
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| RpcError::protocol("truncated state token"))?;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| RpcError::protocol("truncated state token"))?;
    *cursor = end;
    Ok(slice)
}

fn read_framed<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = u32::from_le_bytes(read_slice(bytes, cursor, 4)?.try_into().unwrap()) as usize;
    read_slice(bytes, cursor, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{DataKind, Field};

    #[test]
    fn round_trips_state_without_schemas() {
        let codec = TokenCodec::new();
        let state = serde_json::json!({"offset": 42});
        let token = codec.pack(&state, None, None).unwrap();
        let unpacked = codec.unpack(&token).unwrap();
        assert_eq!(unpacked.state, state);
        assert!(unpacked.output_schema.is_none());
        assert!(unpacked.input_schema.is_none());
    }

    #[test]
    fn round_trips_state_with_schemas() {
        let codec = TokenCodec::new();
        let schema = Schema::new(vec![Field::new("n", DataKind::Int64, false)]);
        let token = codec
            .pack(&serde_json::json!({}), Some(&schema), Some(&schema))
            .unwrap();
        let unpacked = codec.unpack(&token).unwrap();
        assert_eq!(unpacked.output_schema, Some(schema.clone()));
        assert_eq!(unpacked.input_schema, Some(schema));
    }

    #[test]
    fn rejects_tampered_tokens() {
        let codec = TokenCodec::new();
        let token = codec.pack(&serde_json::json!({"a": 1}), None, None).unwrap();
        let mut bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&token)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let tampered = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        assert!(codec.unpack(&tampered).is_err());
    }

    #[test]
    fn rejects_tokens_signed_by_a_different_key() {
        let a = TokenCodec::new();
        let b = TokenCodec::new();
        let token = a.pack(&serde_json::json!({}), None, None).unwrap();
        assert!(b.unpack(&token).is_err());
    }

    #[test]
    fn zero_ttl_disables_the_expiry_check() {
        let codec = TokenCodec::new().with_ttl(Duration::from_secs(0));
        let token = codec.pack(&serde_json::json!({}), None, None).unwrap();
        assert!(codec.unpack(&token).is_ok());
    }

    #[test]
    fn a_freshly_minted_token_is_within_ttl() {
        let codec = TokenCodec::new().with_ttl(Duration::from_secs(1));
        let token = codec.pack(&serde_json::json!({}), None, None).unwrap();
        assert!(codec.unpack(&token).is_ok());
    }
}
