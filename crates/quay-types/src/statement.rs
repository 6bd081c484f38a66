use postgres_types::Type;

/// One `variable = value` pair from a SET statement. The value is kept as
/// written; quoting is stripped when the assignment is reported back to the
/// client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableAssign {
    pub name: String,
    pub value: String,
}

/// Classification of a parsed statement, as reported by the SQL frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,

    Create,
    Drop,
    Alter,

    Begin,
    Commit,
    Rollback,

    Set(Vec<VariableAssign>),

    /// Whitespace-only / no-op statement.
    Empty,

    /// Parsed, but not a class this proxy knows a command tag for.
    Other,
}

impl StatementKind {
    pub fn is_transaction_control(&self) -> bool {
        matches!(self, StatementKind::Commit | StatementKind::Rollback)
    }
}

/// Output column metadata carried by statement contexts and query results.
/// Length and type-name metadata derive from the type tag.
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub label: String,
    pub ty: Type,
}

impl ColumnDescription {
    pub fn new(label: impl Into<String>, ty: Type) -> Self {
        Self {
            label: label.into(),
            ty,
        }
    }
}

/// Parsed-statement context produced by the external SQL frontend. The
/// protocol engine never inspects SQL text itself; everything it needs to
/// know about a statement lives here.
#[derive(Debug, Clone)]
pub struct StatementContext {
    pub sql: String,
    pub kind: StatementKind,
    /// Inferred parameter types, one per placeholder.
    pub param_types: Vec<Type>,
    /// Output shape; `None` for statements that produce no rows.
    pub columns: Option<Vec<ColumnDescription>>,
    /// Remap from declared parameter order to the backend's positional
    /// convention; `None` when they agree.
    pub param_order: Option<Vec<usize>>,
}

impl StatementContext {
    pub fn empty(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: StatementKind::Empty,
            param_types: Vec::new(),
            columns: None,
            param_order: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("syntax error: {0}")]
    Syntax(String),
}

/// External SQL parsing/classification collaborator. A simple query may hold
/// several `;`-separated commands; extended-protocol Parse requires exactly
/// one.
pub trait SqlFrontend: Send + Sync {
    fn parse(&self, sql: &str) -> Result<Vec<StatementContext>, FrontendError>;
}
