use crate::{
    statement::{ColumnDescription, StatementContext},
    value::{Row, Value},
};

/// Fault raised by the backend-execution collaborator, carrying the vendor
/// error code so it can be surfaced to the client unchanged.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Pull interface over a row-producing result. The caller's pace is the
/// backpressure; nothing is prefetched.
pub trait RowStream: Send {
    fn try_next(&mut self) -> Result<Option<Row>, BackendError>;
}

impl RowStream for std::vec::IntoIter<Row> {
    fn try_next(&mut self) -> Result<Option<Row>, BackendError> {
        Ok(self.next())
    }
}

pub struct QueryHeader {
    pub columns: Vec<ColumnDescription>,
    pub rows: Box<dyn RowStream>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateHeader {
    pub affected: u64,
}

/// What the backend produced for one statement execution.
pub enum ResultHeader {
    Query(QueryHeader),
    Update(UpdateHeader),
}

/// The backend-execution collaborator. Calls block the connection's worker
/// and nothing else; batch execution is a single round trip and fails as a
/// unit.
pub trait BackendExecutor: Send {
    fn execute(
        &mut self,
        ctx: &StatementContext,
        params: Vec<Value>,
    ) -> Result<ResultHeader, BackendError>;

    fn execute_batch(
        &mut self,
        ctx: &StatementContext,
        param_sets: Vec<Vec<Value>>,
    ) -> Result<u64, BackendError>;
}

/// Hands out one dedicated backend executor per client connection.
pub trait BackendPool: Send + Sync {
    fn dedicated(&self) -> Result<Box<dyn BackendExecutor>, BackendError>;
}
