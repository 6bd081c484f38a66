//! Extended-query protocol executors: Parse, Bind, Describe, Execute, Sync,
//! Close.

use std::sync::Arc;

use pgwire::{
    api::results::FieldFormat,
    messages::{
        data::{NoData, ParameterDescription},
        extendedquery::{BindComplete, CloseComplete, ParseComplete, PortalSuspended},
        response::EmptyQueryResponse,
        PgWireBackendMessage,
    },
};
use quay_types::{
    backend::{BackendExecutor, ResultHeader},
    statement::StatementContext,
};
use tokio::sync::mpsc::Sender;
use tracing::trace;

use crate::{
    dispatch::{BindData, CloseData, DescribeData, ExecuteData, ParseData},
    executor::query::{QueryExecutor, QueryStreamError},
    portal::{CursorState, Portal},
    response,
    send, send_error,
    session::Session,
    sql_state::SqlState,
    statement::PreparedStatement,
    value::decode_bind_parameters,
    BackendResponse, BoxError, Proxy,
};

pub(super) fn parse(
    data: ParseData,
    session: &mut Session,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let mut contexts = match proxy.frontend.parse(&data.query) {
        Ok(contexts) => contexts,
        Err(e) => {
            return send_error(
                back_tx,
                "ERROR",
                SqlState::SYNTAX_ERROR.code(),
                e.to_string(),
                true,
            )
        }
    };
    if contexts.len() > 1 {
        return send_error(
            back_tx,
            "ERROR",
            SqlState::PROTOCOL_VIOLATION.code(),
            "only 1 command per Parse is allowed",
            true,
        );
    }
    let ctx = contexts
        .pop()
        .unwrap_or_else(|| StatementContext::empty(data.query.clone()));

    session
        .statements
        .register(PreparedStatement::new(data.name, ctx, &data.type_oids));

    send(
        back_tx,
        PgWireBackendMessage::ParseComplete(ParseComplete::new()),
        false,
    )
}

pub(super) fn bind(
    data: BindData,
    session: &mut Session,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let Some(statement) = session.statements.get(&data.statement) else {
        return send_error(
            back_tx,
            "ERROR",
            SqlState::INVALID_SQL_STATEMENT_NAME.code(),
            "statement not found",
            true,
        );
    };

    let values = match decode_bind_parameters(
        proxy.codec.as_ref(),
        &statement.param_types,
        &data.param_formats,
        &data.parameters,
    ) {
        Ok(values) => values,
        Err(e) => {
            return send_error(back_tx, "ERROR", e.sql_state().code(), e.to_string(), true)
        }
    };
    let parameters = statement.adjust_parameter_order(values);

    let result_formats = data
        .result_formats
        .iter()
        .copied()
        .map(FieldFormat::from)
        .collect();

    // pure state construction; no rows are fetched at bind time
    session.portals.add(Portal::new(
        data.portal,
        statement,
        parameters,
        result_formats,
    ));

    send(
        back_tx,
        PgWireBackendMessage::BindComplete(BindComplete::new()),
        false,
    )
}

pub(super) fn describe(
    data: DescribeData,
    session: &mut Session,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    match data.target {
        b'S' => match session.statements.get(&data.name) {
            None => send_error(
                back_tx,
                "ERROR",
                SqlState::INVALID_SQL_STATEMENT_NAME.code(),
                "statement not found",
                true,
            ),
            Some(statement) if statement.is_empty_statement() => send(
                back_tx,
                PgWireBackendMessage::NoData(NoData::new()),
                false,
            ),
            Some(statement) => {
                send(
                    back_tx,
                    PgWireBackendMessage::ParameterDescription(ParameterDescription::new(
                        statement.param_types.iter().map(|t| t.oid()).collect(),
                    )),
                    false,
                )?;
                match &statement.ctx.columns {
                    Some(columns) => send(
                        back_tx,
                        PgWireBackendMessage::RowDescription(response::row_description(
                            columns,
                            &[],
                        )),
                        false,
                    ),
                    None => send(
                        back_tx,
                        PgWireBackendMessage::NoData(NoData::new()),
                        false,
                    ),
                }
            }
        },
        b'P' => match session.portals.get(&data.name) {
            None => send_error(
                back_tx,
                "ERROR",
                SqlState::INVALID_CURSOR_NAME.code(),
                "portal not found",
                true,
            ),
            Some(portal) if portal.statement.is_empty_statement() => send(
                back_tx,
                PgWireBackendMessage::NoData(NoData::new()),
                false,
            ),
            Some(portal) => match &portal.statement.ctx.columns {
                Some(columns) => send(
                    back_tx,
                    PgWireBackendMessage::RowDescription(response::row_description(
                        columns,
                        &portal.result_formats,
                    )),
                    false,
                ),
                None => send(
                    back_tx,
                    PgWireBackendMessage::NoData(NoData::new()),
                    false,
                ),
            },
        },
        _ => send_error(
            back_tx,
            "FATAL",
            SqlState::PROTOCOL_VIOLATION.code(),
            "unexpected describe target",
            true,
        ),
    }
}

enum ExecutePlan {
    Empty,
    AlreadyExhausted(Arc<PreparedStatement>),
    Resume(Arc<PreparedStatement>, QueryExecutor),
    Start(Arc<PreparedStatement>),
}

pub(super) fn execute(
    data: ExecuteData,
    session: &mut Session,
    backend: &mut dyn BackendExecutor,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let max_rows = if data.max_rows <= 0 {
        usize::MAX
    } else {
        data.max_rows as usize
    };

    let plan = match session.portals.get_mut(&data.name) {
        None => {
            return send_error(
                back_tx,
                "ERROR",
                SqlState::INVALID_CURSOR_NAME.code(),
                "portal not found",
                true,
            )
        }
        Some(portal) if portal.statement.is_empty_statement() => ExecutePlan::Empty,
        Some(portal) => match std::mem::replace(&mut portal.state, CursorState::Exhausted) {
            CursorState::Ready => ExecutePlan::Start(portal.statement.clone()),
            CursorState::Suspended(exec) => {
                ExecutePlan::Resume(portal.statement.clone(), exec)
            }
            CursorState::Exhausted => ExecutePlan::AlreadyExhausted(portal.statement.clone()),
        },
    };

    match plan {
        ExecutePlan::Empty => send(
            back_tx,
            PgWireBackendMessage::EmptyQueryResponse(EmptyQueryResponse::new()),
            false,
        ),
        ExecutePlan::AlreadyExhausted(statement) => send(
            back_tx,
            PgWireBackendMessage::CommandComplete(response::command_complete(
                proxy.dialect,
                &statement.ctx.kind,
                0,
            )),
            true,
        ),
        ExecutePlan::Resume(statement, exec) => {
            trace!("resuming suspended portal: {}", data.name);
            stream_portal_rows(exec, max_rows, &data.name, statement, session, proxy, back_tx)
        }
        ExecutePlan::Start(statement) => {
            let parameters = session
                .portals
                .get(&data.name)
                .map(|portal| portal.parameters.clone())
                .unwrap_or_default();
            match backend.execute(&statement.ctx, parameters) {
                Err(e) => send_error(back_tx, "ERROR", &e.code, e.message.clone(), true),
                Ok(ResultHeader::Update(update)) => response::assemble_update(
                    &statement.ctx,
                    update.affected,
                    session,
                    proxy.dialect,
                    back_tx,
                ),
                Ok(ResultHeader::Query(query)) => {
                    let result_formats = session
                        .portals
                        .get(&data.name)
                        .map(|portal| portal.result_formats.clone())
                        .unwrap_or_default();
                    let fields =
                        Arc::new(response::field_infos(&query.columns, &result_formats));
                    let exec = QueryExecutor::new(fields, query.rows);
                    stream_portal_rows(
                        exec, max_rows, &data.name, statement, session, proxy, back_tx,
                    )
                }
            }
        }
    }
}

/// Streams rows up to the frame's row limit. Hitting the limit suspends the
/// portal with its live stream; draining the stream completes the command.
fn stream_portal_rows(
    mut exec: QueryExecutor,
    max_rows: usize,
    portal_name: &str,
    statement: Arc<PreparedStatement>,
    session: &mut Session,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    let mut count = 0u64;
    loop {
        if count as usize >= max_rows {
            if let Some(portal) = session.portals.get_mut(portal_name) {
                portal.state = CursorState::Suspended(exec);
            }
            return send(
                back_tx,
                PgWireBackendMessage::PortalSuspended(PortalSuspended::new()),
                true,
            );
        }
        match exec.next() {
            Ok(true) => {
                count += 1;
                if let Some(row) = exec.current_row() {
                    send(back_tx, PgWireBackendMessage::DataRow(row), false)?;
                }
            }
            Ok(false) => break,
            Err(QueryStreamError::Backend(e)) => {
                return send_error(back_tx, "ERROR", &e.code, e.message.clone(), true)
            }
            Err(QueryStreamError::Encode(e)) => {
                return send_error(
                    back_tx,
                    "ERROR",
                    SqlState::INTERNAL_ERROR.code(),
                    e.to_string(),
                    true,
                )
            }
        }
    }

    send(
        back_tx,
        PgWireBackendMessage::CommandComplete(response::command_complete(
            proxy.dialect,
            &statement.ctx.kind,
            count,
        )),
        true,
    )
}

pub(super) fn sync(
    session: &Session,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    send(
        back_tx,
        PgWireBackendMessage::ReadyForQuery(session.txn.ready_for_query()),
        true,
    )
}

pub(super) fn close(
    data: CloseData,
    session: &mut Session,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    match data.target {
        b'S' => {
            if session.statements.remove(&data.name) {
                session.portals.close_for_statement(&data.name);
            }
            send(
                back_tx,
                PgWireBackendMessage::CloseComplete(CloseComplete::new()),
                true,
            )
        }
        b'P' => {
            session.portals.close(&data.name);
            send(
                back_tx,
                PgWireBackendMessage::CloseComplete(CloseComplete::new()),
                true,
            )
        }
        _ => send_error(
            back_tx,
            "FATAL",
            SqlState::PROTOCOL_VIOLATION.code(),
            "unexpected close target",
            true,
        ),
    }
}
