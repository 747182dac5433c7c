//! A thin façade over the columnar IPC library (spec §2, §3).
//!
//! The external collaborator — `arrow-ipc`/`arrow-array`/`arrow-schema` — is
//! treated as a black box that can serialize/deserialize a schema and a
//! record batch. It has no notion of "a stream carries per-batch
//! string-keyed metadata"; Arrow's own `RecordBatch` type carries none. This
//! module is the adapter that supplies exactly that: a [`Stream`] is our own
//! small envelope (one schema frame, zero or more metadata-tagged batch
//! frames, an end-of-stream marker) wrapped around otherwise-vanilla Arrow
//! IPC bytes for each individual piece.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int32Array, Int64Array,
    RecordBatch, RecordBatchOptions, StringArray,
};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef};

use crate::error::{Result, RpcError};

/// The scalar data kinds this crate's wire contract can carry. Deliberately
/// small: spec's example protocol only ever needs numerics, strings, bools
/// and raw bytes, and the registry's `param_types_json` carries any
/// domain-specific type tag beyond these verbatim as an opaque string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Bool,
    Int32,
    Int64,
    Float64,
    Utf8,
    Binary,
}

impl DataKind {
    fn to_arrow(self) -> DataType {
        match self {
            DataKind::Bool => DataType::Boolean,
            DataKind::Int32 => DataType::Int32,
            DataKind::Int64 => DataType::Int64,
            DataKind::Float64 => DataType::Float64,
            DataKind::Utf8 => DataType::Utf8,
            DataKind::Binary => DataType::Binary,
        }
    }

    fn from_arrow(dt: &DataType) -> Result<Self> {
        Ok(match dt {
            DataType::Boolean => DataKind::Bool,
            DataType::Int32 => DataKind::Int32,
            DataType::Int64 => DataKind::Int64,
            DataType::Float64 => DataKind::Float64,
            DataType::Utf8 => DataKind::Utf8,
            DataType::Binary => DataKind::Binary,
            other => {
                return Err(RpcError::protocol(format!(
                    "unsupported wire data type: {other:?}"
                )))
            }
        })
    }
}

/// A single field: name, kind, nullability. Schemas are pure values; two
/// schemas with the same ordered field list compare equal (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: DataKind,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: DataKind, nullable: bool) -> Self {
        Field {
            name: name.into(),
            kind,
            nullable,
        }
    }
}

/// An ordered sequence of [`Field`]s. Freely cloned; structural equality.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema { fields }
    }

    pub fn empty() -> Self {
        Schema { fields: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn to_arrow(&self) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.fields
                .iter()
                .map(|f| ArrowField::new(f.name.clone(), f.kind.to_arrow(), f.nullable))
                .collect::<Vec<_>>(),
        ))
    }

    fn from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(Field {
                    name: f.name().clone(),
                    kind: DataKind::from_arrow(f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema { fields })
    }

    /// Serialize a self-contained IPC stream whose only content is the
    /// schema message and end-of-stream marker — exactly the shape spec
    /// §4.3 wants for `params_schema_ipc`/`result_schema_ipc`/`header_schema_ipc`.
    pub fn to_ipc_bytes(&self) -> Result<Vec<u8>> {
        let arrow_schema = self.to_arrow();
        let mut writer = StreamWriter::try_new(Vec::new(), &arrow_schema)?;
        writer.finish()?;
        Ok(writer.into_inner()?)
    }

    /// Inverse of [`Schema::to_ipc_bytes`].
    pub fn from_ipc_bytes(bytes: &[u8]) -> Result<Self> {
        let reader = StreamReader::try_new(bytes, None)?;
        Schema::from_arrow(reader.schema().as_ref())
    }
}

/// A scalar wire value. Row-major values feeding [`Batch::from_rows`] and
/// returned from [`Batch::rows`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl Value {
    pub(crate) fn kind(&self) -> Option<DataKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataKind::Bool),
            Value::Int32(_) => Some(DataKind::Int32),
            Value::Int64(_) => Some(DataKind::Int64),
            Value::Float64(_) => Some(DataKind::Float64),
            Value::Utf8(_) => Some(DataKind::Utf8),
            Value::Binary(_) => Some(DataKind::Binary),
        }
    }
}

/// A rectangular, immutable batch shaped to a [`Schema`], with row count,
/// per-field columnar payload, and a string→string metadata map (spec §3).
#[derive(Debug, Clone)]
pub struct Batch {
    schema: Schema,
    metadata: BTreeMap<String, String>,
    row_count: usize,
    arrow: RecordBatch,
}

impl Batch {
    /// Build a batch from row-major scalar values. `rows[i][j]` is the value
    /// of field `j` in row `i`. An empty `rows` with a non-empty schema
    /// still needs a concrete column for each field, so `rows` must have at
    /// least as many columns declared as the schema even when zero rows are
    /// supplied — callers pass `vec![]` and this builds empty typed arrays.
    pub fn from_rows(
        schema: &Schema,
        rows: &[Vec<Value>],
        metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        for row in rows {
            if row.len() != schema.fields.len() {
                return Err(RpcError::protocol(format!(
                    "row has {} values, schema declares {} fields",
                    row.len(),
                    schema.fields.len()
                )));
            }
        }

        let row_count = rows.len();
        let columns: Vec<ArrayRef> = schema
            .fields
            .iter()
            .enumerate()
            .map(|(col_idx, field)| build_column(field, rows, col_idx))
            .collect::<Result<_>>()?;

        let arrow_schema = schema.to_arrow();
        let arrow = if columns.is_empty() {
            let options = RecordBatchOptions::new().with_row_count(Some(row_count));
            RecordBatch::try_new_with_options(arrow_schema, columns, &options)?
        } else {
            RecordBatch::try_new(arrow_schema, columns)?
        };

        Ok(Batch {
            schema: schema.clone(),
            metadata,
            row_count,
            arrow,
        })
    }

    /// A zero-row batch shaped to `schema` carrying only metadata — the
    /// shape every log/error/continuation batch takes (spec §3).
    pub fn empty(schema: &Schema, metadata: BTreeMap<String, String>) -> Result<Self> {
        Batch::from_rows(schema, &[], metadata)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn metadata_get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Attach (or overwrite) one metadata entry, returning the batch by
    /// value. Used to stamp a rotated continuation token onto an
    /// already-built result batch (spec §4.6) without rebuilding it.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The approximate size in bytes this batch would occupy on the wire,
    /// used by the HTTP producer loop to track its byte budget (spec §4.6).
    pub fn approx_wire_len(&self) -> Result<usize> {
        Ok(self.to_ipc_bytes()?.len())
    }

    /// Read the batch back out row-major. Used by the wire codec to parse
    /// request/result batches and by clients reading producer/exchange data.
    pub fn rows(&self) -> Result<Vec<Vec<Value>>> {
        let mut rows = vec![Vec::with_capacity(self.schema.fields.len()); self.row_count];
        for (col_idx, field) in self.schema.fields.iter().enumerate() {
            let column = self.arrow.column(col_idx);
            for row_idx in 0..self.row_count {
                let value = read_cell(field.kind, column.as_ref(), row_idx)?;
                rows[row_idx].push(value);
            }
        }
        Ok(rows)
    }

    /// Serialize this single batch as a self-contained IPC stream frame:
    /// schema message, one record-batch message, end-of-stream marker.
    fn to_ipc_bytes(&self) -> Result<Vec<u8>> {
        let arrow_schema = self.schema.to_arrow();
        let mut writer = StreamWriter::try_new(Vec::new(), &arrow_schema)?;
        writer.write(&self.arrow)?;
        writer.finish()?;
        Ok(writer.into_inner()?)
    }

    fn from_ipc_bytes(bytes: &[u8], metadata: BTreeMap<String, String>) -> Result<Self> {
        let mut reader = StreamReader::try_new(bytes, None)?;
        let schema = Schema::from_arrow(reader.schema().as_ref())?;
        let arrow = match reader.next() {
            Some(batch) => batch?,
            None => {
                let options = RecordBatchOptions::new().with_row_count(Some(0));
                RecordBatch::try_new_with_options(reader.schema(), Vec::new(), &options)?
            }
        };
        let row_count = arrow.num_rows();
        Ok(Batch {
            schema,
            metadata,
            row_count,
            arrow,
        })
    }
}

fn build_column(field: &Field, rows: &[Vec<Value>], col_idx: usize) -> Result<ArrayRef> {
    macro_rules! collect_opt {
        ($variant:ident) => {{
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(match &row[col_idx] {
                    Value::$variant(v) => Some(v.clone()),
                    Value::Null => {
                        if !field.nullable {
                            return Err(RpcError::contract(format!(
                                "field {:?} is non-nullable but got null",
                                field.name
                            )));
                        }
                        None
                    }
                    other => {
                        return Err(RpcError::contract(format!(
                            "field {:?} expects {:?}, got {other:?}",
                            field.name, field.kind
                        )))
                    }
                });
            }
            out
        }};
    }

    Ok(match field.kind {
        DataKind::Bool => Arc::new(BooleanArray::from(collect_opt!(Bool))) as ArrayRef,
        DataKind::Int32 => Arc::new(Int32Array::from(collect_opt!(Int32))) as ArrayRef,
        DataKind::Int64 => Arc::new(Int64Array::from(collect_opt!(Int64))) as ArrayRef,
        DataKind::Float64 => Arc::new(Float64Array::from(collect_opt!(Float64))) as ArrayRef,
        DataKind::Utf8 => Arc::new(StringArray::from(collect_opt!(Utf8))) as ArrayRef,
        DataKind::Binary => {
            let vals: Vec<Option<Vec<u8>>> = collect_opt!(Binary);
            let refs: Vec<Option<&[u8]>> = vals.iter().map(|v| v.as_deref()).collect();
            Arc::new(BinaryArray::from(refs)) as ArrayRef
        }
    })
}

fn read_cell(kind: DataKind, column: &dyn Array, row_idx: usize) -> Result<Value> {
    if column.is_null(row_idx) {
        return Ok(Value::Null);
    }
    Ok(match kind {
        DataKind::Bool => Value::Bool(
            column
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("column kind matches schema")
                .value(row_idx),
        ),
        DataKind::Int32 => Value::Int32(
            column
                .as_any()
                .downcast_ref::<Int32Array>()
                .expect("column kind matches schema")
                .value(row_idx),
        ),
        DataKind::Int64 => Value::Int64(
            column
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("column kind matches schema")
                .value(row_idx),
        ),
        DataKind::Float64 => Value::Float64(
            column
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("column kind matches schema")
                .value(row_idx),
        ),
        DataKind::Utf8 => Value::Utf8(
            column
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("column kind matches schema")
                .value(row_idx)
                .to_string(),
        ),
        DataKind::Binary => Value::Binary(
            column
                .as_any()
                .downcast_ref::<BinaryArray>()
                .expect("column kind matches schema")
                .value(row_idx)
                .to_vec(),
        ),
    })
}

/// A framed byte sequence containing exactly one schema message, zero or
/// more record-batch messages, and an end-of-stream marker (spec GLOSSARY).
///
/// The wire encoding is this crate's own envelope, not raw Arrow IPC bytes:
/// a length-prefixed schema frame, then zero or more tagged batch frames
/// (each one a self-contained Arrow IPC mini-stream plus our metadata map),
/// then a single end-of-stream byte.
const FRAME_TAG_BATCH: u8 = 1;
const FRAME_TAG_END: u8 = 0;

pub fn write_stream(schema: &Schema, batches: &[Batch]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let schema_bytes = schema.to_ipc_bytes()?;
    out.extend_from_slice(&(schema_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&schema_bytes);

    for batch in batches {
        out.push(FRAME_TAG_BATCH);
        let meta_json = serde_json::to_vec(&batch.metadata)
            .map_err(|e| RpcError::protocol(format!("metadata serialization failed: {e}")))?;
        out.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&meta_json);
        out.extend_from_slice(&(batch.row_count as u32).to_le_bytes());
        let arrow_bytes = batch.to_ipc_bytes()?;
        out.extend_from_slice(&(arrow_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&arrow_bytes);
    }

    out.push(FRAME_TAG_END);
    Ok(out)
}

pub fn read_stream(bytes: &[u8]) -> Result<(Schema, Vec<Batch>)> {
    let (schema, batches, consumed) = read_stream_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(RpcError::protocol("trailing bytes after end of IPC stream"));
    }
    Ok((schema, batches))
}

/// As [`read_stream`], but tolerates (and reports back) trailing bytes
/// instead of treating them as an error — used to pull the first of two
/// concatenated streams out of an HTTP response body (spec §4.6: a header
/// stream followed directly by a data stream, with no length prefix of its
/// own between them).
pub fn read_stream_prefix(bytes: &[u8]) -> Result<(Schema, Vec<Batch>, usize)> {
    let mut cursor = 0usize;
    let schema_len = read_u32(bytes, &mut cursor)? as usize;
    let schema_bytes = read_slice(bytes, &mut cursor, schema_len)?;
    let schema = Schema::from_ipc_bytes(schema_bytes)?;

    let mut batches = Vec::new();
    loop {
        let tag = read_u8(bytes, &mut cursor)?;
        if tag == FRAME_TAG_END {
            break;
        }
        if tag != FRAME_TAG_BATCH {
            return Err(RpcError::protocol(format!("unknown stream frame tag {tag}")));
        }
        let meta_len = read_u32(bytes, &mut cursor)? as usize;
        let meta_bytes = read_slice(bytes, &mut cursor, meta_len)?;
        let metadata: BTreeMap<String, String> = serde_json::from_slice(meta_bytes)
            .map_err(|e| RpcError::protocol(format!("metadata deserialization failed: {e}")))?;
        let _row_count = read_u32(bytes, &mut cursor)?;
        let arrow_len = read_u32(bytes, &mut cursor)? as usize;
        let arrow_bytes = read_slice(bytes, &mut cursor, arrow_len)?;
        batches.push(Batch::from_ipc_bytes(arrow_bytes, metadata)?);
    }

    Ok((schema, batches, cursor))
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8> {
    let b = *bytes
        .get(*cursor)
        .ok_or_else(|| RpcError::protocol("truncated IPC stream"))?;
    *cursor += 1;
    Ok(b)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| RpcError::protocol("truncated IPC stream"))?;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| RpcError::protocol("truncated IPC stream"))?;
    *cursor = end;
    Ok(slice)
}

/// Incremental writer over an `AsyncWrite`, for the pipe transport where a
/// stream's batches are produced one tick at a time rather than collected
/// up front (spec §4.5, §4.8). Writes the schema frame on construction and
/// a batch frame per [`FrameWriter::write_batch`] call; callers must call
/// [`FrameWriter::finish`] to emit the end-of-stream marker.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: tokio::io::AsyncWrite + Unpin> FrameWriter<W> {
    pub async fn open(mut inner: W, schema: &Schema) -> Result<Self> {
        use tokio::io::AsyncWriteExt;
        let schema_bytes = schema.to_ipc_bytes()?;
        inner
            .write_all(&(schema_bytes.len() as u32).to_le_bytes())
            .await?;
        inner.write_all(&schema_bytes).await?;
        inner.flush().await?;
        Ok(FrameWriter { inner })
    }

    pub async fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let meta_json = serde_json::to_vec(batch.metadata())
            .map_err(|e| RpcError::protocol(format!("metadata serialization failed: {e}")))?;
        let arrow_bytes = batch.to_ipc_bytes()?;

        self.inner.write_all(&[FRAME_TAG_BATCH]).await?;
        self.inner
            .write_all(&(meta_json.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(&meta_json).await?;
        self.inner
            .write_all(&(batch.row_count() as u32).to_le_bytes())
            .await?;
        self.inner
            .write_all(&(arrow_bytes.len() as u32).to_le_bytes())
            .await?;
        self.inner.write_all(&arrow_bytes).await?;
        // Eager flush: spec §4.8 requires the pipe server not depend on the
        // scheduler to drain the write buffer before the next read.
        self.inner.flush().await?;
        tracing::trace!(rows = batch.row_count(), bytes = arrow_bytes.len(), "wrote batch frame");
        Ok(())
    }

    pub async fn finish(mut self) -> Result<W> {
        use tokio::io::AsyncWriteExt;
        self.inner.write_all(&[FRAME_TAG_END]).await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

/// Incremental reader, the dual of [`FrameWriter`]. Reads the schema frame
/// eagerly on construction; each call to [`FrameReader::next_batch`]
/// blocks for exactly one more frame and returns `None` at end-of-stream.
pub struct FrameReader<R> {
    inner: R,
    schema: Schema,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameReader<R> {
    pub async fn open(mut inner: R) -> Result<Self> {
        use tokio::io::AsyncReadExt;
        let mut len_buf = [0u8; 4];
        inner.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut schema_bytes = vec![0u8; len];
        inner.read_exact(&mut schema_bytes).await?;
        let schema = Schema::from_ipc_bytes(&schema_bytes)?;
        Ok(FrameReader { inner, schema })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        use tokio::io::AsyncReadExt;
        let mut tag = [0u8; 1];
        match self.inner.read_exact(&mut tag).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if tag[0] == FRAME_TAG_END {
            return Ok(None);
        }
        if tag[0] != FRAME_TAG_BATCH {
            return Err(RpcError::protocol(format!(
                "unknown stream frame tag {}",
                tag[0]
            )));
        }

        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let meta_len = u32::from_le_bytes(len_buf) as usize;
        let mut meta_bytes = vec![0u8; meta_len];
        self.inner.read_exact(&mut meta_bytes).await?;
        let metadata: BTreeMap<String, String> = serde_json::from_slice(&meta_bytes)
            .map_err(|e| RpcError::protocol(format!("metadata deserialization failed: {e}")))?;

        self.inner.read_exact(&mut len_buf).await?; // row_count, unused: derived from the batch itself
        self.inner.read_exact(&mut len_buf).await?;
        let arrow_len = u32::from_le_bytes(len_buf) as usize;
        let mut arrow_bytes = vec![0u8; arrow_len];
        self.inner.read_exact(&mut arrow_bytes).await?;

        let batch = Batch::from_ipc_bytes(&arrow_bytes, metadata)?;
        tracing::trace!(rows = batch.row_count(), bytes = arrow_len, "read batch frame");
        Ok(Some(batch))
    }

    /// Drain the remainder of the input stream to its end-of-stream marker
    /// without interpreting the batches (spec §4.5's "drain discipline").
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_batch().await?.is_some() {}
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataKind::Float64, false),
            Field::new("b", DataKind::Utf8, true),
        ])
    }

    #[test]
    fn round_trips_rows_through_a_stream() {
        let schema = sample_schema();
        let rows = vec![
            vec![Value::Float64(1.5), Value::Utf8("hi".into())],
            vec![Value::Float64(-0.0), Value::Null],
        ];
        let batch = Batch::from_rows(&schema, &rows, BTreeMap::new()).unwrap();
        let bytes = write_stream(&schema, std::slice::from_ref(&batch)).unwrap();
        let (read_schema, read_batches) = read_stream(&bytes).unwrap();
        assert_eq!(read_schema, schema);
        assert_eq!(read_batches.len(), 1);
        let got_rows = read_batches[0].rows().unwrap();
        assert_eq!(got_rows[0][0], Value::Float64(1.5));
        assert_eq!(got_rows[0][1], Value::Utf8("hi".into()));
        assert_eq!(got_rows[1][1], Value::Null);
    }

    #[test]
    fn round_trips_unicode_strings_and_binary_edge_cases() {
        let schema = Schema::new(vec![
            Field::new("s", DataKind::Utf8, true),
            Field::new("b", DataKind::Binary, true),
            Field::new("i", DataKind::Int64, false),
        ]);
        let rows = vec![
            vec![
                Value::Utf8("\u{1F980}\u{1F600} \u{4E2D}\u{6587} \u{0627}\u{0644}\u{0639}\u{0631}\u{0628}\u{064A}\u{0629}".into()),
                Value::Binary(vec![0, 1, 0, 2, 0]),
                Value::Int64(i64::MAX),
            ],
            vec![
                Value::Utf8(String::new()),
                Value::Binary(Vec::new()),
                Value::Int64(i64::MIN),
            ],
        ];
        let batch = Batch::from_rows(&schema, &rows, BTreeMap::new()).unwrap();
        let bytes = write_stream(&schema, std::slice::from_ref(&batch)).unwrap();
        let (read_schema, read_batches) = read_stream(&bytes).unwrap();
        assert_eq!(read_schema, schema);
        let got_rows = read_batches[0].rows().unwrap();
        assert_eq!(got_rows, rows);
    }

    #[test]
    fn preserves_floating_point_edge_values() {
        let schema = Schema::new(vec![Field::new("v", DataKind::Float64, false)]);
        let rows = vec![
            vec![Value::Float64(f64::NAN)],
            vec![Value::Float64(f64::INFINITY)],
            vec![Value::Float64(f64::NEG_INFINITY)],
            vec![Value::Float64(-0.0)],
        ];
        let batch = Batch::from_rows(&schema, &rows, BTreeMap::new()).unwrap();
        let bytes = write_stream(&schema, std::slice::from_ref(&batch)).unwrap();
        let (_, read_back) = read_stream(&bytes).unwrap();
        let got = read_back[0].rows().unwrap();
        assert!(matches!(got[0][0], Value::Float64(f) if f.is_nan()));
        assert_eq!(got[1][0], Value::Float64(f64::INFINITY));
        assert_eq!(got[2][0], Value::Float64(f64::NEG_INFINITY));
        assert!(matches!(got[3][0], Value::Float64(f) if f == 0.0 && f.is_sign_negative()));
    }

    #[test]
    fn zero_row_batch_with_metadata_only() {
        let schema = Schema::empty();
        let mut meta = BTreeMap::new();
        meta.insert("log_level".to_string(), "INFO".to_string());
        let batch = Batch::empty(&schema, meta).unwrap();
        let bytes = write_stream(&schema, std::slice::from_ref(&batch)).unwrap();
        let (_, batches) = read_stream(&bytes).unwrap();
        assert_eq!(batches[0].row_count(), 0);
        assert_eq!(batches[0].metadata_get("log_level"), Some("INFO"));
    }

    #[test]
    fn empty_stream_round_trips() {
        let schema = sample_schema();
        let bytes = write_stream(&schema, &[]).unwrap();
        let (read_schema, batches) = read_stream(&bytes).unwrap();
        assert_eq!(read_schema, schema);
        assert!(batches.is_empty());
    }

    #[test]
    fn schema_only_ipc_bytes_round_trip() {
        let schema = sample_schema();
        let bytes = schema.to_ipc_bytes().unwrap();
        let back = Schema::from_ipc_bytes(&bytes).unwrap();
        assert_eq!(schema, back);
    }

    #[tokio::test]
    async fn frame_writer_and_reader_round_trip_over_a_duplex_pipe() {
        let schema = sample_schema();
        let (client, server) = tokio::io::duplex(4096);

        let write_schema = schema.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::open(client, &write_schema).await.unwrap();
            let rows = vec![vec![Value::Float64(2.0), Value::Utf8("x".into())]];
            let batch = Batch::from_rows(&write_schema, &rows, BTreeMap::new()).unwrap();
            writer.write_batch(&batch).await.unwrap();
            writer.finish().await.unwrap();
        });

        let mut reader = FrameReader::open(server).await.unwrap();
        assert_eq!(reader.schema(), &schema);
        let batch = reader.next_batch().await.unwrap().expect("one batch");
        assert_eq!(batch.rows().unwrap()[0][0], Value::Float64(2.0));
        assert!(reader.next_batch().await.unwrap().is_none());

        writer_task.await.unwrap();
    }
}
