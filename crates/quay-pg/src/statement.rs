use std::{collections::HashMap, sync::Arc};

use compact_str::CompactString;
use postgres_types::Type;
use quay_types::{
    statement::{StatementContext, StatementKind},
    value::Value,
};

/// A parsed, named statement template awaiting parameter binding. The empty
/// name denotes the unnamed statement.
pub struct PreparedStatement {
    pub name: CompactString,
    pub ctx: Arc<StatementContext>,
    /// One type per placeholder: Parse-declared OIDs win, the SQL frontend's
    /// inferred types fill the remainder.
    pub param_types: Vec<Type>,
}

impl PreparedStatement {
    pub fn new(name: impl Into<CompactString>, ctx: StatementContext, declared_oids: &[u32]) -> Self {
        let mut param_types = ctx.param_types.clone();
        for (i, oid) in declared_oids.iter().enumerate() {
            if let Some(ty) = Type::from_oid(*oid) {
                if i < param_types.len() {
                    param_types[i] = ty;
                } else {
                    param_types.push(ty);
                }
            }
        }
        Self {
            name: name.into(),
            ctx: Arc::new(ctx),
            param_types,
        }
    }

    pub fn is_empty_statement(&self) -> bool {
        matches!(self.ctx.kind, StatementKind::Empty)
    }

    /// Reorders decoded parameters into the backend's positional convention.
    /// A remap that does not cover every parameter is ignored.
    pub fn adjust_parameter_order(&self, params: Vec<Value>) -> Vec<Value> {
        match &self.ctx.param_order {
            Some(order)
                if order.len() == params.len() && order.iter().all(|&i| i < params.len()) =>
            {
                order.iter().map(|&i| params[i].clone()).collect()
            }
            _ => params,
        }
    }
}

/// Per-connection mapping from statement name to prepared statement.
/// Mutated only by the owning connection's worker.
#[derive(Default)]
pub struct PreparedStatementRegistry {
    statements: HashMap<CompactString, Arc<PreparedStatement>>,
}

impl PreparedStatementRegistry {
    /// Registers a statement, replacing any prior statement of the same name.
    pub fn register(&mut self, statement: PreparedStatement) -> Arc<PreparedStatement> {
        let statement = Arc::new(statement);
        self.statements
            .insert(statement.name.clone(), statement.clone());
        statement
    }

    pub fn get(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.statements.remove(name).is_some()
    }
}
