use pgwire::messages::response::{
    ReadyForQuery, READY_STATUS_IDLE, READY_STATUS_TRANSACTION_BLOCK,
};

use crate::{portal::PortalContext, statement::PreparedStatementRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InBlock,
}

impl TransactionStatus {
    pub fn ready_for_query(self) -> ReadyForQuery {
        match self {
            TransactionStatus::Idle => ReadyForQuery::new(READY_STATUS_IDLE),
            TransactionStatus::InBlock => ReadyForQuery::new(READY_STATUS_TRANSACTION_BLOCK),
        }
    }
}

/// Per-connection protocol state, owned by the connection's worker and passed
/// explicitly to every executor.
pub struct Session {
    pub statements: PreparedStatementRegistry,
    pub portals: PortalContext,
    pub txn: TransactionStatus,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            statements: PreparedStatementRegistry::default(),
            portals: PortalContext::default(),
            txn: TransactionStatus::Idle,
        }
    }
}
