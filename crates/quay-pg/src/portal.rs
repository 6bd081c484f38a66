use std::{collections::HashMap, sync::Arc};

use compact_str::CompactString;
use pgwire::api::results::FieldFormat;
use quay_types::value::Value;

use crate::{executor::query::QueryExecutor, statement::PreparedStatement};

/// Streaming state of a bound portal.
pub enum CursorState {
    /// Bound, not yet executed.
    Ready,
    /// Partially streamed; the live row stream resumes on the next Execute.
    Suspended(QueryExecutor),
    Exhausted,
}

/// A bound, executable instance of a prepared statement. The empty name
/// denotes the unnamed portal.
pub struct Portal {
    pub name: CompactString,
    pub statement: Arc<PreparedStatement>,
    pub parameters: Vec<Value>,
    pub result_formats: Vec<FieldFormat>,
    pub state: CursorState,
}

impl Portal {
    pub fn new(
        name: impl Into<CompactString>,
        statement: Arc<PreparedStatement>,
        parameters: Vec<Value>,
        result_formats: Vec<FieldFormat>,
    ) -> Self {
        Self {
            name: name.into(),
            statement,
            parameters,
            result_formats,
            state: CursorState::Ready,
        }
    }
}

/// Per-connection registry of live portals, at most one per name.
#[derive(Default)]
pub struct PortalContext {
    portals: HashMap<CompactString, Portal>,
}

impl PortalContext {
    /// Registers a portal under its name; rebinding a name drops the prior
    /// portal.
    pub fn add(&mut self, portal: Portal) {
        self.portals.insert(portal.name.clone(), portal);
    }

    pub fn get(&self, name: &str) -> Option<&Portal> {
        self.portals.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Portal> {
        self.portals.get_mut(name)
    }

    pub fn close(&mut self, name: &str) -> bool {
        self.portals.remove(name).is_some()
    }

    /// Drops every portal bound to the named statement.
    pub fn close_for_statement(&mut self, statement_name: &str) {
        self.portals
            .retain(|_, portal| portal.statement.name != statement_name);
    }

    /// Drops every portal; a commit or rollback invalidates open cursors.
    pub fn close_all(&mut self) {
        self.portals.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.portals.is_empty()
    }
}
