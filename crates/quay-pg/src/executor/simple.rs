//! Simple-query executor: parse, execute, and answer each `;`-separated
//! command in order, then report readiness.

use std::sync::Arc;

use pgwire::messages::{response::EmptyQueryResponse, PgWireBackendMessage};
use quay_types::backend::{BackendExecutor, ResultHeader};
use tokio::sync::mpsc::Sender;

use crate::{
    dispatch::QueryData,
    executor::query::{QueryExecutor, QueryStreamError},
    response, send, send_error,
    session::Session,
    sql_state::SqlState,
    BackendResponse, BoxError, Proxy,
};

pub(super) fn execute(
    data: QueryData,
    session: &mut Session,
    backend: &mut dyn BackendExecutor,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let contexts = match proxy.frontend.parse(&data.sql) {
        Ok(contexts) => contexts,
        Err(e) => {
            send_error(
                back_tx,
                "ERROR",
                SqlState::SYNTAX_ERROR.code(),
                e.to_string(),
                true,
            )?;
            return ready(session, back_tx);
        }
    };

    if contexts.is_empty() {
        send(
            back_tx,
            PgWireBackendMessage::EmptyQueryResponse(EmptyQueryResponse::new()),
            false,
        )?;
        return ready(session, back_tx);
    }

    'commands: for ctx in &contexts {
        match backend.execute(ctx, Vec::new()) {
            Err(e) => {
                // an error aborts the remainder of the query string
                send_error(back_tx, "ERROR", &e.code, e.message.clone(), true)?;
                break 'commands;
            }
            Ok(ResultHeader::Update(update)) => {
                response::assemble_update(ctx, update.affected, session, proxy.dialect, back_tx)?;
            }
            Ok(ResultHeader::Query(query)) => {
                let fields = Arc::new(response::field_infos(&query.columns, &[]));
                send(
                    back_tx,
                    PgWireBackendMessage::RowDescription(response::row_description(
                        &query.columns,
                        &[],
                    )),
                    true,
                )?;

                let mut exec = QueryExecutor::new(fields, query.rows);
                let mut count = 0u64;
                loop {
                    match exec.next() {
                        Ok(true) => {
                            count += 1;
                            if let Some(row) = exec.current_row() {
                                send(back_tx, PgWireBackendMessage::DataRow(row), false)?;
                            }
                        }
                        Ok(false) => break,
                        Err(QueryStreamError::Backend(e)) => {
                            send_error(back_tx, "ERROR", &e.code, e.message.clone(), true)?;
                            break 'commands;
                        }
                        Err(QueryStreamError::Encode(e)) => {
                            send_error(
                                back_tx,
                                "ERROR",
                                SqlState::INTERNAL_ERROR.code(),
                                e.to_string(),
                                true,
                            )?;
                            break 'commands;
                        }
                    }
                }

                send(
                    back_tx,
                    PgWireBackendMessage::CommandComplete(response::command_complete(
                        proxy.dialect,
                        &ctx.kind,
                        count,
                    )),
                    true,
                )?;
            }
        }
    }

    ready(session, back_tx)
}

fn ready(session: &Session, back_tx: &Sender<BackendResponse>) -> Result<(), BoxError> {
    send(
        back_tx,
        PgWireBackendMessage::ReadyForQuery(session.txn.ready_for_query()),
        true,
    )
}
