//! Pull-based driver over one row-producing result.

use std::sync::Arc;

use pgwire::{
    api::results::{DataRowEncoder, FieldInfo},
    error::{PgWireError, PgWireResult},
    messages::data::DataRow,
};
use quay_types::{
    backend::{BackendError, RowStream},
    value::{Row, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Backend call finished, no row pulled yet.
    Executed,
    Streaming,
    /// Terminal; further `next` calls report no more rows.
    Exhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryStreamError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("could not encode row: {0}")]
    Encode(PgWireError),
}

/// Streams a backend row result as wire data rows at the caller's pace.
pub struct QueryExecutor {
    fields: Arc<Vec<FieldInfo>>,
    rows: Box<dyn RowStream>,
    current: Option<DataRow>,
    state: ExecutorState,
}

impl QueryExecutor {
    pub fn new(fields: Arc<Vec<FieldInfo>>, rows: Box<dyn RowStream>) -> Self {
        Self {
            fields,
            rows,
            current: None,
            state: ExecutorState::Executed,
        }
    }

    pub fn fields(&self) -> &Arc<Vec<FieldInfo>> {
        &self.fields
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Pulls and encodes the next row. Returns false once the stream is
    /// exhausted; exhaustion is terminal.
    pub fn next(&mut self) -> Result<bool, QueryStreamError> {
        if self.state == ExecutorState::Exhausted {
            return Ok(false);
        }
        match self.rows.try_next()? {
            Some(row) => {
                self.current =
                    Some(encode_row(&self.fields, &row).map_err(QueryStreamError::Encode)?);
                self.state = ExecutorState::Streaming;
                Ok(true)
            }
            None => {
                self.current = None;
                self.state = ExecutorState::Exhausted;
                Ok(false)
            }
        }
    }

    /// Takes the row produced by the last successful `next` call.
    pub fn current_row(&mut self) -> Option<DataRow> {
        self.current.take()
    }
}

fn encode_row(fields: &Arc<Vec<FieldInfo>>, row: &Row) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(fields.clone());
    for value in row {
        match value {
            Value::Null => encoder.encode_field(&None::<i8>)?,
            Value::Bool(v) => encoder.encode_field(v)?,
            Value::Int2(v) => encoder.encode_field(v)?,
            Value::Int4(v) => encoder.encode_field(v)?,
            Value::Int8(v) => encoder.encode_field(v)?,
            Value::Float4(v) => encoder.encode_field(v)?,
            Value::Float8(v) => encoder.encode_field(v)?,
            Value::Text(v) => encoder.encode_field(&v.as_str())?,
            Value::Bytes(v) => encoder.encode_field(&v.as_slice())?,
        }
    }
    encoder.finish()
}
