//! Method registry and describe-batch construction (spec §4.3).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::*;
use crate::error::{Result, RpcError};
use crate::ipc::{Batch, DataKind, Field, Schema, Value};

/// A single row of named scalar values: a handler's params or a single
/// result/data row. `BTreeMap` keeps iteration order stable, which matters
/// when a handler builds a row from a language-level struct-like value.
pub type Row = BTreeMap<String, Value>;

/// Per-call context handed to every handler. Exposes `client_log`, the
/// out-of-band logging operation spec §4.4 attaches to the context rather
/// than threading through every return type.
#[derive(Default)]
pub struct HandlerContext {
    logs: Vec<LogEntry>,
}

pub(crate) struct LogEntry {
    pub level: String,
    pub message: String,
    pub extra: Option<serde_json::Value>,
}

impl HandlerContext {
    pub fn new() -> Self {
        HandlerContext::default()
    }

    pub fn client_log(
        &mut self,
        level: impl Into<String>,
        message: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) {
        self.logs.push(LogEntry {
            level: level.into(),
            message: message.into(),
            extra,
        });
    }

    pub(crate) fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs)
    }
}

/// Accumulates the output of one producer tick or one exchange round: zero
/// or more log entries, at most one data row, and (producer mode only) the
/// `finish` flag that ends the stream (spec §4.5).
pub struct OutputCollector {
    logs: Vec<LogEntry>,
    row: Option<Row>,
    finished: bool,
    allow_finish: bool,
}

impl OutputCollector {
    pub(crate) fn new(allow_finish: bool) -> Self {
        OutputCollector {
            logs: Vec::new(),
            row: None,
            finished: false,
            allow_finish,
        }
    }

    pub fn log(
        &mut self,
        level: impl Into<String>,
        message: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) {
        self.logs.push(LogEntry {
            level: level.into(),
            message: message.into(),
            extra,
        });
    }

    /// Emit the single data row for this call. Calling it twice is a
    /// handler contract violation: at most one data batch per input batch.
    pub fn emit(&mut self, row: Row) -> Result<()> {
        if self.row.is_some() {
            return Err(RpcError::contract(
                "handler emitted more than one data row for a single input batch",
            ));
        }
        self.row = Some(row);
        Ok(())
    }

    /// Producer-only: end the stream after this tick's output is written.
    pub fn finish(&mut self) -> Result<()> {
        if !self.allow_finish {
            return Err(RpcError::contract(
                "finish() is only valid for producer-shaped methods",
            ));
        }
        self.finished = true;
        Ok(())
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn into_parts(self) -> (Vec<LogEntry>, Option<Row>) {
        (self.logs, self.row)
    }
}

#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, params: Row, ctx: &mut HandlerContext) -> Result<Row>;
}

/// Shared behavior for producer- and exchange-shaped methods (spec §4.5:
/// "two closely related state machines share code"). `input` is `None` for
/// a producer tick and `Some` for an exchange round.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn init(&self, params: Row, ctx: &mut HandlerContext) -> Result<serde_json::Value>;

    async fn header_init(
        &self,
        _params: &Row,
        _state: &serde_json::Value,
        _ctx: &mut HandlerContext,
    ) -> Result<Row> {
        Err(RpcError::contract("method declares no header schema"))
    }

    async fn step(
        &self,
        state: serde_json::Value,
        input: Option<Row>,
        out: &mut OutputCollector,
    ) -> Result<serde_json::Value>;
}

/// Resolve the two reserved override keys a handler's `init` state may
/// carry (spec §4.5, §9): a per-invocation output schema, and a flip
/// between producer and exchange shape.
pub fn resolve_overrides(
    state: &serde_json::Value,
    registered_output: &Schema,
    registered_is_producer: bool,
) -> Result<(Schema, bool)> {
    let output = match state.get(STATE_OVERRIDE_OUTPUT_SCHEMA) {
        Some(v) => schema_from_json(v)?,
        None => registered_output.clone(),
    };
    let is_producer = match state.get(STATE_OVERRIDE_IS_PRODUCER) {
        Some(v) => v.as_bool().ok_or_else(|| {
            RpcError::contract(format!("{STATE_OVERRIDE_IS_PRODUCER} must be a bool"))
        })?,
        None => registered_is_producer,
    };
    Ok((output, is_producer))
}

fn schema_from_json(v: &serde_json::Value) -> Result<Schema> {
    let fields = v
        .as_array()
        .ok_or_else(|| RpcError::contract(format!("{STATE_OVERRIDE_OUTPUT_SCHEMA} must be an array")))?
        .iter()
        .map(|f| {
            let name = f
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| RpcError::contract("override schema field missing 'name'"))?
                .to_string();
            let kind = match f.get("kind").and_then(|k| k.as_str()) {
                Some("bool") => DataKind::Bool,
                Some("int32") => DataKind::Int32,
                Some("int64") => DataKind::Int64,
                Some("float64") => DataKind::Float64,
                Some("utf8") => DataKind::Utf8,
                Some("binary") => DataKind::Binary,
                other => {
                    return Err(RpcError::contract(format!(
                        "override schema field has unsupported kind {other:?}"
                    )))
                }
            };
            let nullable = f.get("nullable").and_then(|n| n.as_bool()).unwrap_or(true);
            Ok(Field::new(name, kind, nullable))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(fields))
}

pub struct UnaryMethod {
    pub params_schema: Schema,
    pub result_schema: Schema,
    pub has_return: bool,
    pub doc: Option<String>,
    pub param_types_json: Option<String>,
    pub param_defaults_json: Option<String>,
    pub handler: Arc<dyn UnaryHandler>,
}

pub struct ProducerMethod {
    /// Schema of the one-shot init request (spec §3: "Producer (parameter
    /// schema, output schema, ...)"), e.g. `{limit, batch_size}` for a
    /// counting method. Distinct from the per-tick data-loop input, which
    /// is always empty for a producer.
    pub params_schema: Schema,
    pub result_schema: Schema,
    pub header_schema: Option<Schema>,
    pub doc: Option<String>,
    pub param_types_json: Option<String>,
    pub param_defaults_json: Option<String>,
    pub handler: Arc<dyn StreamHandler>,
}

pub struct ExchangeMethod {
    /// Schema of the one-shot init request, e.g. `{factor}` for a scaling
    /// method.
    pub params_schema: Schema,
    /// Schema of each round's data row, e.g. `{value}`. Distinct from
    /// `params_schema`: spec §3 lists Exchange as "(parameter schema,
    /// input schema, output schema, ...)" — two separate schemas.
    pub input_schema: Schema,
    pub result_schema: Schema,
    pub header_schema: Option<Schema>,
    pub doc: Option<String>,
    pub param_types_json: Option<String>,
    pub param_defaults_json: Option<String>,
    pub handler: Arc<dyn StreamHandler>,
}

pub enum Method {
    Unary(UnaryMethod),
    Producer(ProducerMethod),
    Exchange(ExchangeMethod),
}

impl Method {
    pub fn method_type(&self) -> &'static str {
        match self {
            Method::Unary(_) => "unary",
            Method::Producer(_) | Method::Exchange(_) => "stream",
        }
    }

    pub fn is_producer_shaped(&self) -> bool {
        matches!(self, Method::Producer(_))
    }

    pub fn params_schema(&self) -> Schema {
        match self {
            Method::Unary(m) => m.params_schema.clone(),
            Method::Producer(m) => m.params_schema.clone(),
            Method::Exchange(m) => m.params_schema.clone(),
        }
    }

    /// Schema of each data-loop tick: always empty for a producer (the
    /// client drives it with zero-row ticks), the method's declared
    /// per-round row shape for an exchange. Distinct from
    /// [`Method::params_schema`], which is the one-shot init request shape.
    pub fn round_input_schema(&self) -> Schema {
        match self {
            Method::Unary(_) | Method::Producer(_) => Schema::empty(),
            Method::Exchange(m) => m.input_schema.clone(),
        }
    }

    pub fn result_schema(&self) -> &Schema {
        match self {
            Method::Unary(m) => &m.result_schema,
            Method::Producer(m) => &m.result_schema,
            Method::Exchange(m) => &m.result_schema,
        }
    }

    pub fn header_schema(&self) -> Option<&Schema> {
        match self {
            Method::Unary(_) => None,
            Method::Producer(m) => m.header_schema.as_ref(),
            Method::Exchange(m) => m.header_schema.as_ref(),
        }
    }

    pub fn doc(&self) -> Option<&str> {
        match self {
            Method::Unary(m) => m.doc.as_deref(),
            Method::Producer(m) => m.doc.as_deref(),
            Method::Exchange(m) => m.doc.as_deref(),
        }
    }

    pub fn has_return(&self) -> bool {
        match self {
            Method::Unary(m) => m.has_return,
            Method::Producer(_) | Method::Exchange(_) => true,
        }
    }

    pub fn param_types_json(&self) -> Option<&str> {
        match self {
            Method::Unary(m) => m.param_types_json.as_deref(),
            Method::Producer(m) => m.param_types_json.as_deref(),
            Method::Exchange(m) => m.param_types_json.as_deref(),
        }
    }

    pub fn param_defaults_json(&self) -> Option<&str> {
        match self {
            Method::Unary(m) => m.param_defaults_json.as_deref(),
            Method::Producer(m) => m.param_defaults_json.as_deref(),
            Method::Exchange(m) => m.param_defaults_json.as_deref(),
        }
    }

    pub fn stream_handler(&self) -> Option<&Arc<dyn StreamHandler>> {
        match self {
            Method::Unary(_) => None,
            Method::Producer(m) => Some(&m.handler),
            Method::Exchange(m) => Some(&m.handler),
        }
    }
}

/// An immutable, sorted set of named methods (spec §3, §4.3). `BTreeMap`
/// gives us the "keyed by method name, sorted lexicographically" describe
/// ordering for free, without a separate sort step.
pub struct Protocol {
    pub name: String,
    methods: BTreeMap<String, Method>,
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Protocol {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, method: Method) -> &mut Self {
        self.methods.insert(name.into(), method);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    fn describe_schema() -> Schema {
        Schema::new(vec![
            Field::new("name", DataKind::Utf8, false),
            Field::new("method_type", DataKind::Utf8, false),
            Field::new("doc", DataKind::Utf8, true),
            Field::new("has_return", DataKind::Bool, false),
            Field::new("params_schema_ipc", DataKind::Binary, false),
            Field::new("result_schema_ipc", DataKind::Binary, false),
            Field::new("param_types_json", DataKind::Utf8, true),
            Field::new("param_defaults_json", DataKind::Utf8, true),
            Field::new("has_header", DataKind::Bool, false),
            Field::new("header_schema_ipc", DataKind::Binary, true),
        ])
    }

    /// Build the `__describe__` response batch (spec §4.3).
    pub fn describe_batch(&self, server_id: &str) -> Result<Batch> {
        let schema = Self::describe_schema();
        let mut rows = Vec::with_capacity(self.methods.len());
        for (name, method) in &self.methods {
            let header_schema = method.header_schema();
            rows.push(vec![
                Value::Utf8(name.clone()),
                Value::Utf8(method.method_type().to_string()),
                method
                    .doc()
                    .map(|d| Value::Utf8(d.to_string()))
                    .unwrap_or(Value::Null),
                Value::Bool(method.has_return()),
                Value::Binary(method.params_schema().to_ipc_bytes()?),
                Value::Binary(method.result_schema().to_ipc_bytes()?),
                method
                    .param_types_json()
                    .map(|s| Value::Utf8(s.to_string()))
                    .unwrap_or(Value::Null),
                method
                    .param_defaults_json()
                    .map(|s| Value::Utf8(s.to_string()))
                    .unwrap_or(Value::Null),
                Value::Bool(header_schema.is_some()),
                match header_schema {
                    Some(s) => Value::Binary(s.to_ipc_bytes()?),
                    None => Value::Null,
                },
            ]);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(KEY_PROTOCOL_NAME.to_string(), self.name.clone());
        metadata.insert(KEY_REQUEST_VERSION.to_string(), REQUEST_VERSION.to_string());
        metadata.insert(KEY_DESCRIBE_VERSION.to_string(), DESCRIBE_VERSION.to_string());
        metadata.insert(KEY_SERVER_ID.to_string(), server_id.to_string());

        Batch::from_rows(&schema, &rows, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl UnaryHandler for Echo {
        async fn call(&self, params: Row, _ctx: &mut HandlerContext) -> Result<Row> {
            Ok(params)
        }
    }

    #[test]
    fn describe_batch_lists_methods_in_sorted_order() {
        let mut protocol = Protocol::new("demo");
        protocol.register(
            "zeta",
            Method::Unary(UnaryMethod {
                params_schema: Schema::empty(),
                result_schema: Schema::empty(),
                has_return: false,
                doc: None,
                param_types_json: None,
                param_defaults_json: None,
                handler: Arc::new(Echo),
            }),
        );
        protocol.register(
            "alpha",
            Method::Unary(UnaryMethod {
                params_schema: Schema::empty(),
                result_schema: Schema::empty(),
                has_return: false,
                doc: Some("first".into()),
                param_types_json: None,
                param_defaults_json: None,
                handler: Arc::new(Echo),
            }),
        );

        let batch = protocol.describe_batch("srv-1").unwrap();
        let rows = batch.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Utf8("alpha".into()));
        assert_eq!(rows[1][0], Value::Utf8("zeta".into()));
        assert_eq!(
            batch.metadata_get(KEY_DESCRIBE_VERSION),
            Some(DESCRIBE_VERSION)
        );
    }

    #[test]
    fn override_output_schema_replaces_registered_schema() {
        let registered = Schema::empty();
        let state = serde_json::json!({
            STATE_OVERRIDE_OUTPUT_SCHEMA: [
                {"name": "n", "kind": "int64", "nullable": false}
            ]
        });
        let (resolved, is_producer) = resolve_overrides(&state, &registered, true).unwrap();
        assert_eq!(resolved.fields.len(), 1);
        assert!(is_producer);
    }

    #[test]
    fn output_collector_rejects_a_second_emit() {
        let mut out = OutputCollector::new(true);
        out.emit(Row::new()).unwrap();
        assert!(out.emit(Row::new()).is_err());
    }

    #[test]
    fn output_collector_rejects_finish_outside_producer_mode() {
        let mut out = OutputCollector::new(false);
        assert!(out.finish().is_err());
    }
}
