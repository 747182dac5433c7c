//! Dispatchers: the code that sits between a parsed request batch and a
//! registered handler, for each of the three method shapes and two
//! transports (spec §4.4, §4.5, §4.6).

pub mod http;
pub mod pipe;
pub mod unary;

use crate::error::{Result, RpcError};
use crate::ipc::{Batch, Schema, Value};
use crate::registry::Row;

/// Read a batch's first row (or an all-absent row, for a zero-column
/// schema) into a [`Row`] keyed by the declared schema's field names.
/// Shared by all three dispatchers: they all parse a request/data batch
/// the same way, only what happens next differs.
///
/// Enforces spec §4.1/§3 invariant 1: a batch shaped to a non-empty schema
/// must carry exactly one row; a producer's zero-row tick is the only case
/// where an empty schema legitimately carries zero rows.
pub(crate) fn batch_to_row(batch: &Batch, schema: &Schema) -> Result<Row> {
    if !schema.is_empty() && batch.row_count() != 1 {
        return Err(RpcError::protocol(format!(
            "batch has {} rows but its schema is non-empty; expected exactly 1",
            batch.row_count()
        )));
    }
    let rows = batch.rows()?;
    let values = rows.into_iter().next().unwrap_or_default();
    let mut out = Row::new();
    for (field, value) in schema.fields.iter().zip(values.into_iter()) {
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

/// Inverse of [`batch_to_row`]: project a handler's result row onto the
/// declared schema's field order. A missing nullable field is filled with
/// `Value::Null`; a missing non-nullable field is a `ContractError` listing
/// the keys the handler actually returned, since extra keys are silently
/// ignored and the only way to see what went wrong is to see what *did*
/// come back (spec §4.1).
pub(crate) fn row_to_values(schema: &Schema, row: &Row) -> Result<Vec<Value>> {
    schema
        .fields
        .iter()
        .map(|f| match row.get(&f.name) {
            Some(v) => Ok(v.clone()),
            None if f.nullable => Ok(Value::Null),
            None => {
                let received: Vec<&str> = row.keys().map(String::as_str).collect();
                Err(RpcError::contract(format!(
                    "handler result missing required field {:?}; received keys: [{}]",
                    f.name,
                    received.join(", ")
                )))
            }
        })
        .collect()
}
