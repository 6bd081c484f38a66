//! Per-command executors. Each one turns a dispatched command into ordered
//! outbound packets against the session's registries and the backend.

pub mod batch;
pub mod query;

mod extended;
mod simple;

use std::ops::ControlFlow;

use metrics::counter;
use quay_types::backend::BackendExecutor;
use tokio::sync::mpsc::Sender;

use crate::{
    dispatch::Command, send_error, session::Session, sql_state::SqlState, BackendResponse,
    BoxError, Proxy,
};

/// Runs one executable unit. `Break` ends the connection's session loop;
/// errors are channel failures only, every protocol-level failure has already
/// been sent to the client as an error response.
pub fn run(
    command: Command,
    session: &mut Session,
    backend: &mut dyn BackendExecutor,
    proxy: &Proxy,
    back_tx: &Sender<BackendResponse>,
) -> Result<ControlFlow<()>, BoxError> {
    counter!("quay.pg.commands.processed.total").increment(1);
    match command {
        Command::SimpleQuery(data) => simple::execute(data, session, backend, proxy, back_tx)?,
        Command::Parse(data) => extended::parse(data, session, proxy, back_tx)?,
        Command::Bind(data) => extended::bind(data, session, proxy, back_tx)?,
        Command::Describe(data) => extended::describe(data, session, back_tx)?,
        Command::Execute(data) => extended::execute(data, session, backend, proxy, back_tx)?,
        Command::Sync => extended::sync(session, back_tx)?,
        Command::Close(data) => extended::close(data, session, back_tx)?,
        Command::Flush => back_tx.blocking_send(BackendResponse::Flush)?,
        Command::Terminate => return Ok(ControlFlow::Break(())),
        Command::Unsupported(what) => send_error(
            back_tx,
            "ERROR",
            SqlState::FEATURE_NOT_SUPPORTED.code(),
            format!("{what} is not implemented"),
            true,
        )?,
        Command::UnexpectedStartup => send_error(
            back_tx,
            "FATAL",
            SqlState::PROTOCOL_VIOLATION.code(),
            "unexpected startup message",
            true,
        )?,
        Command::Batched(commands) => batch::execute(commands, session, backend, proxy, back_tx)?,
    }
    Ok(ControlFlow::Continue(()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use pgwire::messages::PgWireBackendMessage;
    use postgres_types::Type;
    use quay_types::{
        backend::BackendPool,
        dialect,
        statement::{ColumnDescription, StatementContext, StatementKind},
        value::Value,
    };
    use tokio::sync::mpsc::{channel, Receiver};

    use super::*;
    use crate::{
        dispatch::{BindData, Command, DescribeData, ExecuteData, ParseData, QueryData},
        testing::{BackendCall, MemoryPool, ScriptedFrontend},
        value::ScalarCodec,
    };

    const INSERT_SQL: &str = "INSERT INTO t VALUES ($1)";
    const SELECT_SQL: &str = "SELECT id FROM t";

    fn insert_ctx() -> StatementContext {
        StatementContext {
            sql: INSERT_SQL.into(),
            kind: StatementKind::Insert,
            param_types: vec![Type::INT8],
            columns: None,
            param_order: None,
        }
    }

    fn select_ctx() -> StatementContext {
        StatementContext {
            sql: SELECT_SQL.into(),
            kind: StatementKind::Select,
            param_types: vec![],
            columns: Some(vec![ColumnDescription::new("id", Type::INT8)]),
            param_order: None,
        }
    }

    fn proxy(pool: &MemoryPool) -> Proxy {
        Proxy {
            frontend: Arc::new(
                ScriptedFrontend::new()
                    .register(insert_ctx())
                    .register(select_ctx()),
            ),
            dialect: dialect::lookup("postgresql").unwrap(),
            codec: Arc::new(ScalarCodec),
            backends: Arc::new(pool.clone()),
        }
    }

    fn parse(name: &str, sql: &str) -> Command {
        Command::Parse(ParseData {
            name: name.into(),
            query: sql.into(),
            type_oids: vec![],
        })
    }

    fn bind(statement: &str, value: i64) -> Command {
        Command::Bind(BindData {
            portal: "".into(),
            statement: statement.into(),
            param_formats: vec![1],
            parameters: vec![Some(Bytes::copy_from_slice(&value.to_be_bytes()))],
            result_formats: vec![],
        })
    }

    fn execute_cmd(max_rows: i32) -> Command {
        Command::Execute(ExecuteData {
            name: "".into(),
            max_rows,
        })
    }

    fn run_all(
        commands: Vec<Command>,
        session: &mut Session,
        pool: &MemoryPool,
    ) -> Vec<PgWireBackendMessage> {
        let proxy = proxy(pool);
        let mut backend = pool.dedicated().unwrap();
        let (back_tx, back_rx) = channel(256);
        for command in commands {
            run(command, session, backend.as_mut(), &proxy, &back_tx).unwrap();
        }
        drain(back_rx)
    }

    fn drain(mut back_rx: Receiver<BackendResponse>) -> Vec<PgWireBackendMessage> {
        let mut messages = Vec::new();
        while let Ok(response) = back_rx.try_recv() {
            if let BackendResponse::Message { message, .. } = response {
                messages.push(message);
            }
        }
        messages
    }

    fn encoded(message: &PgWireBackendMessage) -> String {
        let mut buf = bytes::BytesMut::new();
        message.encode(&mut buf).unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn batched_run_issues_one_backend_call_and_fans_out_responses() {
        let pool = MemoryPool::new().with_affected(INSERT_SQL, 1);
        let mut session = Session::default();

        let batch = Command::Batched(vec![
            bind("s1", 1),
            execute_cmd(0),
            bind("s1", 2),
            execute_cmd(0),
            bind("s1", 3),
            execute_cmd(0),
        ]);
        let messages = run_all(
            vec![parse("s1", INSERT_SQL), batch, Command::Sync],
            &mut session,
            &pool,
        );

        assert_eq!(
            pool.calls()
                .iter()
                .filter(|c| matches!(c, BackendCall::ExecuteBatch { sets: 3, .. }))
                .count(),
            1
        );

        // one response per original frame, in original frame order
        assert!(matches!(messages[0], PgWireBackendMessage::ParseComplete(_)));
        assert!(matches!(messages[1], PgWireBackendMessage::BindComplete(_)));
        assert!(matches!(messages[2], PgWireBackendMessage::CommandComplete(_)));
        assert!(matches!(messages[3], PgWireBackendMessage::BindComplete(_)));
        assert!(matches!(messages[4], PgWireBackendMessage::CommandComplete(_)));
        assert!(matches!(messages[5], PgWireBackendMessage::BindComplete(_)));
        assert!(matches!(messages[6], PgWireBackendMessage::CommandComplete(_)));
        assert!(matches!(messages[7], PgWireBackendMessage::ReadyForQuery(_)));
        assert_eq!(messages.len(), 8);
    }

    #[test]
    fn batched_row_counts_floor_divide_the_aggregate() {
        let pool = MemoryPool::new().with_batch_total(INSERT_SQL, 7);
        let mut session = Session::default();

        let batch = Command::Batched(vec![
            bind("s1", 1),
            execute_cmd(0),
            bind("s1", 2),
            execute_cmd(0),
            bind("s1", 3),
            execute_cmd(0),
        ]);
        let messages = run_all(vec![parse("s1", INSERT_SQL), batch], &mut session, &pool);

        let completes: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, PgWireBackendMessage::CommandComplete(_)))
            .collect();
        assert_eq!(completes.len(), 3);
        for complete in completes {
            assert!(encoded(complete).contains("INSERT 0 2"));
        }
    }

    #[test]
    fn batch_without_execute_frames_emits_no_command_complete() {
        let pool = MemoryPool::new().with_batch_total(INSERT_SQL, 5);
        let mut session = Session::default();

        let batch = Command::Batched(vec![
            bind("s1", 1),
            Command::Describe(DescribeData {
                target: b'P',
                name: "".into(),
            }),
            bind("s1", 2),
        ]);
        let messages = run_all(vec![parse("s1", INSERT_SQL), batch], &mut session, &pool);

        // no Execute frames: BindComplete x2 and NoData for the Describe
        assert!(messages
            .iter()
            .any(|m| matches!(m, PgWireBackendMessage::NoData(_))));
        assert!(!messages
            .iter()
            .any(|m| matches!(m, PgWireBackendMessage::CommandComplete(_))));
    }

    #[test]
    fn batch_failure_fails_the_whole_range() {
        let pool = MemoryPool::new().with_failure(INSERT_SQL, "23505", "duplicate key");
        let mut session = Session::default();

        let batch = Command::Batched(vec![
            bind("s1", 1),
            execute_cmd(0),
            bind("s1", 2),
            execute_cmd(0),
        ]);
        let messages = run_all(vec![parse("s1", INSERT_SQL), batch], &mut session, &pool);

        assert!(matches!(messages[0], PgWireBackendMessage::ParseComplete(_)));
        assert!(matches!(messages[1], PgWireBackendMessage::ErrorResponse(_)));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn bind_against_missing_statement_is_a_protocol_error() {
        let pool = MemoryPool::new();
        let mut session = Session::default();
        let messages = run_all(vec![bind("nope", 1)], &mut session, &pool);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], PgWireBackendMessage::ErrorResponse(_)));
    }

    #[test]
    fn row_limit_suspends_then_resumes_without_reexecuting() {
        let pool = MemoryPool::new().with_rows(
            SELECT_SQL,
            vec![
                vec![Value::Int8(1)],
                vec![Value::Int8(2)],
                vec![Value::Int8(3)],
            ],
        );
        let mut session = Session::default();

        let messages = run_all(
            vec![
                parse("q1", SELECT_SQL),
                Command::Bind(BindData {
                    portal: "".into(),
                    statement: "q1".into(),
                    param_formats: vec![],
                    parameters: vec![],
                    result_formats: vec![],
                }),
                execute_cmd(2),
                execute_cmd(0),
            ],
            &mut session,
            &pool,
        );

        let execute_calls = pool
            .calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::Execute { .. }))
            .count();
        assert_eq!(execute_calls, 1);

        let data_rows = messages
            .iter()
            .filter(|m| matches!(m, PgWireBackendMessage::DataRow(_)))
            .count();
        assert_eq!(data_rows, 3);
        assert!(messages
            .iter()
            .any(|m| matches!(m, PgWireBackendMessage::PortalSuspended(_))));
        let complete = messages
            .iter()
            .find(|m| matches!(m, PgWireBackendMessage::CommandComplete(_)))
            .unwrap();
        assert!(encoded(complete).contains("SELECT 1"));
    }

    #[test]
    fn commit_in_simple_query_closes_open_portals() {
        let pool = MemoryPool::new().with_rows(SELECT_SQL, vec![vec![Value::Int8(1)]]);
        let mut session = Session::default();

        run_all(
            vec![
                parse("q1", SELECT_SQL),
                Command::Bind(BindData {
                    portal: "p1".into(),
                    statement: "q1".into(),
                    param_formats: vec![],
                    parameters: vec![],
                    result_formats: vec![],
                }),
            ],
            &mut session,
            &pool,
        );
        assert!(session.portals.get("p1").is_some());

        let messages = run_all(
            vec![Command::SimpleQuery(QueryData {
                sql: "COMMIT".into(),
            })],
            &mut session,
            &pool,
        );
        assert!(session.portals.get("p1").is_none());
        assert!(!messages
            .iter()
            .any(|m| matches!(m, PgWireBackendMessage::RowDescription(_))));
    }

    #[test]
    fn set_statement_reports_each_assignment() {
        let pool = MemoryPool::new();
        let mut session = Session::default();
        let messages = run_all(
            vec![Command::SimpleQuery(QueryData {
                sql: "SET application_name = 'quay', search_path = public".into(),
            })],
            &mut session,
            &pool,
        );
        let statuses = messages
            .iter()
            .filter(|m| matches!(m, PgWireBackendMessage::ParameterStatus(_)))
            .count();
        assert_eq!(statuses, 2);
        let completes = messages
            .iter()
            .filter(|m| matches!(m, PgWireBackendMessage::CommandComplete(_)))
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn unsupported_command_answers_without_closing_the_pipeline() {
        let pool = MemoryPool::new();
        let mut session = Session::default();
        let messages = run_all(
            vec![Command::Unsupported("CopyData"), Command::Sync],
            &mut session,
            &pool,
        );
        assert!(matches!(messages[0], PgWireBackendMessage::ErrorResponse(_)));
        assert!(matches!(messages[1], PgWireBackendMessage::ReadyForQuery(_)));
    }
}
