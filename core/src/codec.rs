//! Wire codec: turning registry lookups and handler results into the batch
//! shapes spec §4.1 defines, and parsing request batches back into calls.

use std::collections::BTreeMap;

use crate::constants::*;
use crate::error::{Result, RpcError};
use crate::ipc::{Batch, DataKind, Field, Schema, Value};
use crate::registry::Row;

/// A parsed request: the method name plus any transport-carried identifiers,
/// read off a request batch's metadata (spec §4.1).
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub method: String,
    pub request_version: String,
    pub request_id: Option<String>,
}

/// Validate and extract the common request metadata every batch must carry
/// before dispatch even looks at the method registry.
pub fn parse_request_header(batch: &Batch) -> Result<RequestHeader> {
    let method = batch
        .metadata_get(KEY_METHOD)
        .ok_or_else(|| RpcError::protocol("request batch missing 'method' metadata"))?
        .to_string();

    let request_version = batch
        .metadata_get(KEY_REQUEST_VERSION)
        .ok_or_else(|| RpcError::protocol("request batch missing 'request_version' metadata"))?
        .to_string();
    if request_version != REQUEST_VERSION {
        return Err(RpcError::version(format!(
            "unsupported request_version {request_version:?}, expected {REQUEST_VERSION:?}"
        )));
    }

    let request_id = batch.metadata_get(KEY_REQUEST_ID).map(str::to_string);

    Ok(RequestHeader {
        method,
        request_version,
        request_id,
    })
}

/// Build a request batch: a single row of parameters (or zero rows for a
/// producer's empty input schema), tagged with the method name, the fixed
/// `request_version`, and an optional caller-supplied request id (spec
/// §4.1). Every transport's client-side call path starts here.
pub fn build_request_batch(
    schema: &Schema,
    row: Option<Vec<Value>>,
    method: &str,
    request_id: Option<&str>,
) -> Result<Batch> {
    let mut metadata = BTreeMap::new();
    metadata.insert(KEY_METHOD.to_string(), method.to_string());
    metadata.insert(KEY_REQUEST_VERSION.to_string(), REQUEST_VERSION.to_string());
    if let Some(id) = request_id {
        metadata.insert(KEY_REQUEST_ID.to_string(), id.to_string());
    }
    match row {
        Some(values) => Batch::from_rows(schema, &[values], metadata),
        None => Batch::empty(schema, metadata),
    }
}

/// Build a normal result batch: the handler's rows, shaped to `schema`,
/// tagged with server identity and the echoed request id.
pub fn build_result_batch(
    schema: &Schema,
    rows: &[Vec<Value>],
    server_id: &str,
    request_id: Option<&str>,
) -> Result<Batch> {
    let mut metadata = BTreeMap::new();
    metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
    if let Some(id) = request_id {
        metadata.insert(KEY_REQUEST_ID.to_string(), id.to_string());
    }
    Batch::from_rows(schema, rows, metadata)
}

/// Build the zero-row, `log_level=EXCEPTION` batch that terminates a stream
/// on error (spec §4.1, §7), shaped to an empty schema.
pub fn build_error_batch(err: &RpcError, server_id: &str, request_id: Option<&str>) -> Result<Batch> {
    build_error_batch_shaped(&Schema::empty(), err, server_id, request_id)
}

/// As [`build_error_batch`], but shaped to an arbitrary schema. Unary and
/// stream dispatchers shape the error batch to the method's declared
/// result (or header) schema so a client's reader doesn't trip on a
/// mid-stream schema change (spec §4.4, §4.5).
pub fn build_error_batch_shaped(
    schema: &Schema,
    err: &RpcError,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<Batch> {
    let mut metadata = BTreeMap::new();
    metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
    if let Some(id) = request_id {
        metadata.insert(KEY_REQUEST_ID.to_string(), id.to_string());
    }
    metadata.insert(KEY_LOG_LEVEL.to_string(), LOG_LEVEL_EXCEPTION.to_string());
    metadata.insert(KEY_LOG_MESSAGE.to_string(), err.wire_message());
    metadata.insert(
        KEY_LOG_EXTRA.to_string(),
        serde_json::to_string(&err.wire_extra())
            .map_err(|e| RpcError::protocol(format!("log_extra serialization failed: {e}")))?,
    );
    Batch::empty(schema, metadata)
}

/// Build an out-of-band, non-terminal log batch (spec §4.1: `log_level`
/// present alongside zero rows, but not `EXCEPTION`).
pub fn build_log_batch(
    level: &str,
    message: &str,
    extra: Option<&serde_json::Value>,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<Batch> {
    let mut metadata = BTreeMap::new();
    metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());
    if let Some(id) = request_id {
        metadata.insert(KEY_REQUEST_ID.to_string(), id.to_string());
    }
    metadata.insert(KEY_LOG_LEVEL.to_string(), level.to_string());
    metadata.insert(KEY_LOG_MESSAGE.to_string(), message.to_string());
    if let Some(extra) = extra {
        metadata.insert(
            KEY_LOG_EXTRA.to_string(),
            serde_json::to_string(extra)
                .map_err(|e| RpcError::protocol(format!("log_extra serialization failed: {e}")))?,
        );
    }
    Batch::empty(&Schema::empty(), metadata)
}

/// How a received batch should be interpreted by a client reading a
/// response/data stream (spec §4.1's batch classification rules).
#[derive(Debug)]
#[allow(dead_code)]
pub enum IncomingBatch<'a> {
    /// Ordinary result/data rows.
    Data(&'a Batch),
    /// `log_level` present, zero rows, not `EXCEPTION`: out-of-band log.
    Log {
        level: &'a str,
        message: &'a str,
        extra: Option<serde_json::Value>,
    },
    /// `log_level=EXCEPTION`, zero rows: terminal error.
    Error(RpcError),
}

/// Classify a batch per spec §4.1. Callers drive their read loop off this
/// instead of re-deriving the metadata rules at every call site.
pub fn classify_batch(batch: &Batch) -> Result<IncomingBatch<'_>> {
    match batch.metadata_get(KEY_LOG_LEVEL) {
        None => Ok(IncomingBatch::Data(batch)),
        Some(level) => {
            if batch.row_count() != 0 {
                return Err(RpcError::protocol(
                    "batch carries log_level metadata but has rows",
                ));
            }
            let message = batch.metadata_get(KEY_LOG_MESSAGE).unwrap_or_default();
            let extra = batch
                .metadata_get(KEY_LOG_EXTRA)
                .map(|raw| {
                    serde_json::from_str::<serde_json::Value>(raw)
                        .map_err(|e| RpcError::protocol(format!("malformed log_extra: {e}")))
                })
                .transpose()?;

            if level == LOG_LEVEL_EXCEPTION {
                let (kind, msg) = message.split_once(": ").unwrap_or(("HandlerError", message));
                let traceback = extra
                    .as_ref()
                    .and_then(|v| v.get("traceback"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let err = match traceback {
                    Some(tb) => RpcError::handler_with_traceback(kind, msg, tb),
                    None => RpcError::handler(kind, msg),
                };
                Ok(IncomingBatch::Error(err))
            } else {
                Ok(IncomingBatch::Log {
                    level,
                    message,
                    extra,
                })
            }
        }
    }
}

/// Dispatch a just-read batch to either a log sink or propagate its error,
/// returning `Ok(Some(batch))` for ordinary data (spec §4.1's client-side
/// convenience wrapper, named directly after the operation in the data model).
pub fn dispatch_log_or_error<'a>(
    batch: &'a Batch,
    mut on_log: impl FnMut(&str, &str, Option<&serde_json::Value>),
) -> Result<Option<&'a Batch>> {
    match classify_batch(batch)? {
        IncomingBatch::Data(b) => Ok(Some(b)),
        IncomingBatch::Log {
            level,
            message,
            extra,
        } => {
            on_log(level, message, extra.as_ref());
            Ok(None)
        }
        IncomingBatch::Error(err) => Err(err),
    }
}

/// Coerce a JSON scalar into a wire [`Value`] of the declared [`DataKind`],
/// applying the big-integer tagging convention of spec §4.2: an integer
/// outside `[-2^53, 2^53]` is carried as a JSON string prefixed
/// `__bigint__:` rather than risk silent float truncation.
pub fn json_to_value(json: &serde_json::Value, field: &Field) -> Result<Value> {
    if json.is_null() {
        if !field.nullable {
            return Err(RpcError::contract(format!(
                "field {:?} is non-nullable but got null",
                field.name
            )));
        }
        return Ok(Value::Null);
    }

    Ok(match field.kind {
        DataKind::Bool => Value::Bool(json.as_bool().ok_or_else(|| {
            RpcError::contract(format!("field {:?} expects a bool", field.name))
        })?),
        DataKind::Int32 => {
            let n = json_to_i64(json, &field.name)?;
            Value::Int32(i32::try_from(n).map_err(|_| {
                RpcError::contract(format!("field {:?} value {n} out of i32 range", field.name))
            })?)
        }
        DataKind::Int64 => Value::Int64(json_to_i64(json, &field.name)?),
        DataKind::Float64 => Value::Float64(json.as_f64().ok_or_else(|| {
            RpcError::contract(format!("field {:?} expects a number", field.name))
        })?),
        DataKind::Utf8 => Value::Utf8(
            json.as_str()
                .ok_or_else(|| RpcError::contract(format!("field {:?} expects a string", field.name)))?
                .to_string(),
        ),
        DataKind::Binary => {
            use base64::Engine;
            let s = json.as_str().ok_or_else(|| {
                RpcError::contract(format!("field {:?} expects base64 bytes", field.name))
            })?;
            Value::Binary(
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| RpcError::contract(format!("invalid base64 in {:?}: {e}", field.name)))?,
            )
        }
    })
}

fn json_to_i64(json: &serde_json::Value, field_name: &str) -> Result<i64> {
    if let Some(s) = json.as_str() {
        let digits = s.strip_prefix(BIGINT_JSON_PREFIX).ok_or_else(|| {
            RpcError::contract(format!(
                "field {field_name:?} string value isn't {BIGINT_JSON_PREFIX}-tagged"
            ))
        })?;
        return digits
            .parse::<i64>()
            .map_err(|e| RpcError::contract(format!("malformed bigint in {field_name:?}: {e}")));
    }
    json.as_i64()
        .ok_or_else(|| RpcError::contract(format!("field {field_name:?} expects an integer")))
}

/// Infer a [`Schema`] from one untyped row (spec's HTTP session: "each
/// `exchange(rows)` call infers an input schema from the first row's keys
/// and the concrete non-null sample values"). Field order follows `row`'s
/// own iteration order — stable, since [`Row`] is a `BTreeMap` sorted by
/// field name. A `Value::Null` sample gives no type evidence, so that field
/// is inferred as a nullable `Utf8`; a server with a stricter declared type
/// for that field will reject it, which is the known, accepted edge case of
/// null-first inference rather than a bug here.
pub fn schema_from_row(row: &Row) -> Schema {
    let fields = row
        .iter()
        .map(|(name, value)| match value.kind() {
            Some(kind) => Field::new(name.clone(), kind, false),
            None => Field::new(name.clone(), DataKind::Utf8, true),
        })
        .collect();
    Schema::new(fields)
}

/// Inverse of [`json_to_value`]: tag integers outside the f64-safe range.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    const SAFE_MAX: i64 = 1 << 53;
    const SAFE_MIN: i64 = -(1 << 53);
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int32(i) => serde_json::json!(i),
        Value::Int64(i) => {
            if *i > SAFE_MAX || *i < SAFE_MIN {
                serde_json::Value::String(format!("{BIGINT_JSON_PREFIX}{i}"))
            } else {
                serde_json::json!(i)
            }
        }
        Value::Float64(f) => serde_json::json!(f),
        Value::Utf8(s) => serde_json::Value::String(s.clone()),
        Value::Binary(bytes) => {
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_request_header() {
        let mut meta = BTreeMap::new();
        meta.insert(KEY_METHOD.to_string(), "add".to_string());
        meta.insert(KEY_REQUEST_VERSION.to_string(), "1".to_string());
        meta.insert(KEY_REQUEST_ID.to_string(), "abc".to_string());
        let batch = Batch::empty(&Schema::empty(), meta).unwrap();
        let header = parse_request_header(&batch).unwrap();
        assert_eq!(header.method, "add");
        assert_eq!(header.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn rejects_wrong_request_version() {
        let mut meta = BTreeMap::new();
        meta.insert(KEY_METHOD.to_string(), "add".to_string());
        meta.insert(KEY_REQUEST_VERSION.to_string(), "99".to_string());
        let batch = Batch::empty(&Schema::empty(), meta).unwrap();
        let err = parse_request_header(&batch).unwrap_err();
        assert!(matches!(err, RpcError::Version(_)));
    }

    #[test]
    fn classifies_error_batches() {
        let err = RpcError::handler("ValueError", "bad factor");
        let batch = build_error_batch(&err, "srv-1", Some("req-1")).unwrap();
        match classify_batch(&batch).unwrap() {
            IncomingBatch::Error(e) => assert_eq!(e.wire_message(), "ValueError: bad factor"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn classifies_log_batches_without_raising() {
        let batch = build_log_batch("INFO", "starting up", None, "srv-1", None).unwrap();
        match classify_batch(&batch).unwrap() {
            IncomingBatch::Log { level, message, .. } => {
                assert_eq!(level, "INFO");
                assert_eq!(message, "starting up");
            }
            other => panic!("expected Log, got {other:?}"),
        }
    }

    #[test]
    fn bigint_round_trips_outside_f64_safe_range() {
        let field = Field::new("n", DataKind::Int64, false);
        let huge = serde_json::json!(format!("{BIGINT_JSON_PREFIX}9007199254740993"));
        let value = json_to_value(&huge, &field).unwrap();
        assert_eq!(value, Value::Int64(9007199254740993));
        let back = value_to_json(&value);
        assert_eq!(back, huge);
    }

    #[test]
    fn small_integers_are_not_tagged() {
        let field = Field::new("n", DataKind::Int64, false);
        let value = json_to_value(&serde_json::json!(42), &field).unwrap();
        assert_eq!(value_to_json(&value), serde_json::json!(42));
    }
}
