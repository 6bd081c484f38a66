//! In-memory collaborators for tests. The real SQL frontend and backend are
//! external to this crate; these stand-ins answer from scripted state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use quay_types::{
    backend::{
        BackendError, BackendExecutor, BackendPool, QueryHeader, ResultHeader, UpdateHeader,
    },
    statement::{
        FrontendError, SqlFrontend, StatementContext, StatementKind, VariableAssign,
    },
    value::Row,
};

/// Answers exact registered statements first, falling back to a keyword
/// classifier so incidental commands in tests still execute.
#[derive(Default)]
pub struct ScriptedFrontend {
    statements: HashMap<String, StatementContext>,
}

impl ScriptedFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, ctx: StatementContext) -> Self {
        self.statements.insert(ctx.sql.clone(), ctx);
        self
    }
}

impl SqlFrontend for ScriptedFrontend {
    fn parse(&self, sql: &str) -> Result<Vec<StatementContext>, FrontendError> {
        let mut out = Vec::new();
        for part in sql.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match self.statements.get(part) {
                Some(ctx) => out.push(ctx.clone()),
                None => out.push(classify(part)?),
            }
        }
        Ok(out)
    }
}

fn classify(sql: &str) -> Result<StatementContext, FrontendError> {
    let verb = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    let kind = match verb.as_str() {
        "SELECT" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" => StatementKind::Create,
        "DROP" => StatementKind::Drop,
        "ALTER" => StatementKind::Alter,
        "BEGIN" | "START" => StatementKind::Begin,
        "COMMIT" | "END" => StatementKind::Commit,
        "ROLLBACK" | "ABORT" => StatementKind::Rollback,
        "SET" => StatementKind::Set(parse_assignments(sql)),
        _ => StatementKind::Other,
    };

    let placeholders = count_placeholders(sql);
    Ok(StatementContext {
        sql: sql.to_owned(),
        kind,
        param_types: vec![postgres_types::Type::TEXT; placeholders],
        columns: None,
        param_order: None,
    })
}

fn count_placeholders(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let digits: String = sql[i + 1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<usize>() {
                max = max.max(n);
            }
        }
        i += 1;
    }
    max
}

fn parse_assignments(sql: &str) -> Vec<VariableAssign> {
    let body = sql
        .trim_start()
        .get(3..)
        .unwrap_or("")
        .trim_start_matches(|c: char| c.is_whitespace());
    body.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some(VariableAssign {
                name: name.trim().to_owned(),
                value: value.trim().to_owned(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Execute { sql: String, params: usize },
    ExecuteBatch { sql: String, sets: usize },
}

#[derive(Default)]
struct BackendState {
    selects: HashMap<String, Vec<Row>>,
    affected: HashMap<String, u64>,
    batch_totals: HashMap<String, u64>,
    failures: HashMap<String, (String, String)>,
}

/// Scripted backend pool; every dedicated executor shares the script and the
/// recorded call log.
#[derive(Default, Clone)]
pub struct MemoryPool {
    state: Arc<Mutex<BackendState>>,
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, sql: &str, rows: Vec<Row>) -> Self {
        self.state.lock().unwrap().selects.insert(sql.into(), rows);
        self
    }

    pub fn with_affected(self, sql: &str, affected: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .affected
            .insert(sql.into(), affected);
        self
    }

    pub fn with_batch_total(self, sql: &str, total: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .batch_totals
            .insert(sql.into(), total);
        self
    }

    pub fn with_failure(self, sql: &str, code: &str, message: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(sql.into(), (code.into(), message.into()));
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl BackendPool for MemoryPool {
    fn dedicated(&self) -> Result<Box<dyn BackendExecutor>, BackendError> {
        Ok(Box::new(MemoryBackend {
            state: self.state.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl BackendExecutor for MemoryBackend {
    fn execute(
        &mut self,
        ctx: &StatementContext,
        params: Vec<quay_types::value::Value>,
    ) -> Result<ResultHeader, BackendError> {
        self.calls.lock().unwrap().push(BackendCall::Execute {
            sql: ctx.sql.clone(),
            params: params.len(),
        });
        let state = self.state.lock().unwrap();
        if let Some((code, message)) = state.failures.get(&ctx.sql) {
            return Err(BackendError::new(code.clone(), message.clone()));
        }
        if matches!(ctx.kind, StatementKind::Select) || ctx.columns.is_some() {
            let rows = state.selects.get(&ctx.sql).cloned().unwrap_or_default();
            return Ok(ResultHeader::Query(QueryHeader {
                columns: ctx.columns.clone().unwrap_or_default(),
                rows: Box::new(rows.into_iter()),
            }));
        }
        Ok(ResultHeader::Update(UpdateHeader {
            affected: state.affected.get(&ctx.sql).copied().unwrap_or(0),
        }))
    }

    fn execute_batch(
        &mut self,
        ctx: &StatementContext,
        param_sets: Vec<Vec<quay_types::value::Value>>,
    ) -> Result<u64, BackendError> {
        self.calls.lock().unwrap().push(BackendCall::ExecuteBatch {
            sql: ctx.sql.clone(),
            sets: param_sets.len(),
        });
        let state = self.state.lock().unwrap();
        if let Some((code, message)) = state.failures.get(&ctx.sql) {
            return Err(BackendError::new(code.clone(), message.clone()));
        }
        match state.batch_totals.get(&ctx.sql) {
            Some(total) => Ok(*total),
            None => {
                let per = state.affected.get(&ctx.sql).copied().unwrap_or(1);
                Ok(per * param_sets.len() as u64)
            }
        }
    }
}
