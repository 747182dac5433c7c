//! Well-known metadata keys, version strings, and other fixed wire constants.
//!
//! Every string here is part of the wire contract (spec §6): changing one
//! changes what bytes mean, not just what this crate happens to name things.

/// Batch metadata key carrying the target method name on a request batch.
pub const KEY_METHOD: &str = "method";
/// Batch metadata key carrying the request protocol version (always `"1"`).
pub const KEY_REQUEST_VERSION: &str = "request_version";
/// Batch metadata key carrying the server's identifier on a response batch.
pub const KEY_SERVER_ID: &str = "server_id";
/// Batch metadata key echoing the caller-supplied request id, if any.
pub const KEY_REQUEST_ID: &str = "request_id";
/// Batch metadata key marking a zero-row batch as a log or error record.
pub const KEY_LOG_LEVEL: &str = "log_level";
/// Batch metadata key carrying the human-readable log/error message.
pub const KEY_LOG_MESSAGE: &str = "log_message";
/// Batch metadata key carrying a JSON-encoded object of extra log/error data.
pub const KEY_LOG_EXTRA: &str = "log_extra";
/// Batch metadata key on the describe batch naming the protocol.
pub const KEY_PROTOCOL_NAME: &str = "protocol_name";
/// Batch metadata key on the describe batch carrying the describe format version.
pub const KEY_DESCRIBE_VERSION: &str = "describe_version";
/// Batch metadata key carrying a base64 state token for HTTP stream continuation.
pub const KEY_STREAM_STATE: &str = "stream_state";

/// Log level recorded on a zero-row batch that represents a terminal error.
pub const LOG_LEVEL_EXCEPTION: &str = "EXCEPTION";

/// The only value `request_version` is ever allowed to carry today.
pub const REQUEST_VERSION: &str = "1";
/// The only value `describe_version` is ever allowed to carry today.
pub const DESCRIBE_VERSION: &str = "2";

/// The reserved method name that triggers introspection instead of dispatch.
pub const DESCRIBE_METHOD_NAME: &str = "__describe__";

/// `created_at`/version/HMAC layout, see [`crate::token`].
pub const TOKEN_VERSION: u8 = 2;
/// Size in bytes of the HMAC-SHA-256 tag appended to every state token.
pub const TOKEN_HMAC_LEN: usize = 32;
/// The smallest a packed, pre-base64 token payload can legally be:
/// 1 (version) + 8 (created_at) + 4 (state_len=0) + 4 (output_schema_len=0)
/// + 4 (input_schema_len=0) + 32 (HMAC) = 53 bytes.
pub const TOKEN_MIN_LEN: usize = 53;

/// Default time-to-live, in seconds, for a state token. Zero disables the check.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Reserved key on a producer/exchange handler's returned state object that,
/// when present, overrides the registered output schema for the remainder
/// of the session (spec §4.5, §9 "a future wire-level revision may lift it
/// into metadata").
pub const STATE_OVERRIDE_OUTPUT_SCHEMA: &str = "__override_output_schema__";
/// Reserved key analogous to [`STATE_OVERRIDE_OUTPUT_SCHEMA`] that lets a
/// handler flip a method between producer and exchange shape per invocation.
pub const STATE_OVERRIDE_IS_PRODUCER: &str = "__override_is_producer__";

/// JSON tag prefix used by the default state serializer to losslessly
/// round-trip integers outside the f64-safe range (spec §4.2).
pub const BIGINT_JSON_PREFIX: &str = "__bigint__:";

/// HTTP request/response content type for an IPC-stream body.
pub const CONTENT_TYPE_ARROW_STREAM: &str = "application/vnd.apache.arrow.stream";

/// `Content-Encoding` value used for the zstd compression filter.
pub const CONTENT_ENCODING_ZSTD: &str = "zstd";

/// Header advertising the server's request-size cap from `__capabilities__`.
pub const HEADER_MAX_REQUEST_BYTES: &str = "VGI-Max-Request-Bytes";
