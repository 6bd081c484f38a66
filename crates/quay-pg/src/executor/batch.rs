//! Batched statements executor: collapses a contiguous bind/execute run over
//! one prepared statement into a single backend round trip, then fans the
//! aggregate result back out as one response per original frame.

use metrics::counter;
use pgwire::messages::{
    data::NoData,
    extendedquery::BindComplete,
    PgWireBackendMessage,
};
use quay_types::backend::BackendExecutor;
use tokio::sync::mpsc::Sender;
use tracing::debug;

use crate::{
    dispatch::Command,
    response, send, send_error,
    session::Session,
    sql_state::SqlState,
    value::decode_bind_parameters,
    BackendResponse, BoxError, Proxy,
};

pub(super) fn execute(
    commands: Vec<Command>,
    session: &mut Session,
    backend: &mut dyn BackendExecutor,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let Some(first_bind) = commands.iter().find_map(|c| match c {
        Command::Bind(bind) => Some(bind),
        _ => None,
    }) else {
        return send_error(
            back_tx,
            "ERROR",
            SqlState::PROTOCOL_VIOLATION.code(),
            "batched range contains no bind",
            true,
        );
    };

    let Some(statement) = session.statements.get(&first_bind.statement) else {
        return send_error(
            back_tx,
            "ERROR",
            SqlState::INVALID_SQL_STATEMENT_NAME.code(),
            "statement not found",
            true,
        );
    };

    // one parameter row per Bind frame, in arrival order
    let mut param_sets = Vec::new();
    for command in &commands {
        if let Command::Bind(bind) = command {
            match decode_bind_parameters(
                proxy.codec.as_ref(),
                &statement.param_types,
                &bind.param_formats,
                &bind.parameters,
            ) {
                Ok(values) => param_sets.push(statement.adjust_parameter_order(values)),
                Err(e) => {
                    return send_error(
                        back_tx,
                        "ERROR",
                        e.sql_state().code(),
                        e.to_string(),
                        true,
                    )
                }
            }
        }
    }

    let execute_count = commands
        .iter()
        .filter(|c| matches!(c, Command::Execute(_)))
        .count() as u64;

    debug!(
        "executing batch of {} statement(s), sql: {}",
        param_sets.len(),
        statement.ctx.sql
    );

    // single round trip; the whole range fails as a unit
    let total = match backend.execute_batch(&statement.ctx, param_sets) {
        Ok(total) => total,
        Err(e) => return send_error(back_tx, "ERROR", &e.code, e.message.clone(), true),
    };
    counter!("quay.pg.batch.executions.total").increment(1);

    // exact per-statement counts are not recoverable from the aggregate;
    // the remainder of the floor division is dropped
    let rows_per_execute = if execute_count == 0 {
        1
    } else {
        total / execute_count
    };

    for command in &commands {
        match command {
            Command::Bind(_) => send(
                back_tx,
                PgWireBackendMessage::BindComplete(BindComplete::new()),
                false,
            )?,
            Command::Describe(_) => match &statement.ctx.columns {
                Some(columns) => send(
                    back_tx,
                    PgWireBackendMessage::RowDescription(response::row_description(
                        columns,
                        &[],
                    )),
                    false,
                )?,
                None => send(
                    back_tx,
                    PgWireBackendMessage::NoData(NoData::new()),
                    false,
                )?,
            },
            Command::Execute(_) => send(
                back_tx,
                PgWireBackendMessage::CommandComplete(response::command_complete(
                    proxy.dialect,
                    &statement.ctx.kind,
                    rows_per_execute,
                )),
                false,
            )?,
            _ => {}
        }
    }
    back_tx.blocking_send(BackendResponse::Flush)?;

    Ok(())
}
