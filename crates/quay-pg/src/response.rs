//! Maps backend result headers into outbound protocol packets.

use pgwire::{
    api::results::{FieldFormat, FieldInfo, Tag},
    messages::{
        data::RowDescription,
        response::{CommandComplete, EmptyQueryResponse},
        startup::ParameterStatus,
        PgWireBackendMessage,
    },
};
use quay_types::{
    dialect::Dialect,
    statement::{ColumnDescription, StatementContext, StatementKind},
};
use tokio::sync::mpsc::Sender;

use crate::{
    send,
    session::{Session, TransactionStatus},
    BackendResponse, BoxError,
};

fn format_for(formats: &[FieldFormat], index: usize) -> FieldFormat {
    match formats.len() {
        0 => FieldFormat::Text,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(FieldFormat::Text),
    }
}

/// Builds wire field descriptors from backend column metadata, applying the
/// requested per-column result formats. Column numbering on the wire is
/// 1-based and handled by the packet constructor.
pub fn field_infos(columns: &[ColumnDescription], formats: &[FieldFormat]) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            FieldInfo::new(
                col.label.clone(),
                None,
                None,
                col.ty.clone(),
                format_for(formats, i),
            )
        })
        .collect()
}

pub fn row_description(columns: &[ColumnDescription], formats: &[FieldFormat]) -> RowDescription {
    let fields = field_infos(columns, formats);
    RowDescription::new(fields.iter().map(Into::into).collect())
}

/// Command-complete packet for a statement class and row count. An
/// unrecognized class tags as the empty string rather than failing.
pub fn command_complete(
    dialect: &dyn Dialect,
    kind: &StatementKind,
    rows: u64,
) -> CommandComplete {
    match kind {
        StatementKind::Insert => CommandComplete::new(format!("INSERT 0 {rows}")),
        StatementKind::Select | StatementKind::Update | StatementKind::Delete => {
            let verb = dialect.command_tag(kind).unwrap_or("");
            Tag::new_for_execution(verb, Some(rows as usize)).into()
        }
        kind => match dialect.command_tag(kind) {
            Some(verb) => Tag::new_for_execution(verb, None).into(),
            None => CommandComplete::new(String::new()),
        },
    }
}

/// Strips one level of matching quotes from a SET assignment value.
fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('\'') && v.ends_with('\''))
            || (v.starts_with('"') && v.ends_with('"')))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Emits the packets for an update-count result and applies its session side
/// effects: a transaction boundary closes every open portal, SET reports each
/// assignment as a parameter status, an empty statement answers with the
/// empty-query response.
pub fn assemble_update(
    ctx: &StatementContext,
    affected: u64,
    session: &mut Session,
    dialect: &dyn Dialect,
    back_tx: &Sender<BackendResponse>,
) -> Result<(), BoxError> {
    if ctx.kind.is_transaction_control() {
        session.portals.close_all();
    }

    match &ctx.kind {
        StatementKind::Set(assigns) => {
            send(
                back_tx,
                PgWireBackendMessage::CommandComplete(command_complete(dialect, &ctx.kind, 0)),
                assigns.is_empty(),
            )?;
            let last = assigns.len().saturating_sub(1);
            for (i, assign) in assigns.iter().enumerate() {
                send(
                    back_tx,
                    PgWireBackendMessage::ParameterStatus(ParameterStatus::new(
                        assign.name.clone(),
                        unquote(&assign.value).to_owned(),
                    )),
                    i == last,
                )?;
            }
        }
        StatementKind::Empty => {
            send(
                back_tx,
                PgWireBackendMessage::EmptyQueryResponse(EmptyQueryResponse::new()),
                true,
            )?;
        }
        kind => {
            send(
                back_tx,
                PgWireBackendMessage::CommandComplete(command_complete(dialect, kind, affected)),
                true,
            )?;
        }
    }

    match ctx.kind {
        StatementKind::Begin => session.txn = TransactionStatus::InBlock,
        StatementKind::Commit | StatementKind::Rollback => session.txn = TransactionStatus::Idle,
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use postgres_types::Type;
    use quay_types::{dialect, statement::VariableAssign};

    use super::*;

    fn encoded(message: PgWireBackendMessage) -> String {
        let mut buf = BytesMut::new();
        message.encode(&mut buf).unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn pg() -> &'static dyn Dialect {
        dialect::lookup("postgresql").unwrap()
    }

    #[test]
    fn insert_tag_carries_zero_oid() {
        let tag = command_complete(pg(), &StatementKind::Insert, 3);
        assert!(encoded(PgWireBackendMessage::CommandComplete(tag)).contains("INSERT 0 3"));
    }

    #[test]
    fn select_tag_carries_row_count() {
        let tag = command_complete(pg(), &StatementKind::Select, 7);
        assert!(encoded(PgWireBackendMessage::CommandComplete(tag)).contains("SELECT 7"));
    }

    #[test]
    fn unknown_class_tags_as_empty_string() {
        let tag = command_complete(pg(), &StatementKind::Other, 7);
        let mut buf = BytesMut::new();
        PgWireBackendMessage::CommandComplete(tag)
            .encode(&mut buf)
            .unwrap();
        // tag byte, length, a single NUL terminator: no verb at all
        assert_eq!(buf.len(), 1 + 4 + 1);
    }

    #[test]
    fn unquote_strips_one_quote_level() {
        assert_eq!(unquote("'quay'"), "quay");
        assert_eq!(unquote("\"quay\""), "quay");
        assert_eq!(unquote("quay"), "quay");
        assert_eq!(unquote("''"), "");
    }

    fn ctx(kind: StatementKind) -> StatementContext {
        StatementContext {
            sql: String::new(),
            kind,
            param_types: Vec::new(),
            columns: None,
            param_order: None,
        }
    }

    #[test]
    fn set_emits_one_complete_then_one_status_per_assignment() {
        let (back_tx, mut back_rx) = tokio::sync::mpsc::channel(16);
        let mut session = Session::default();
        let assigns = vec![
            VariableAssign {
                name: "application_name".into(),
                value: "'quay'".into(),
            },
            VariableAssign {
                name: "search_path".into(),
                value: "public".into(),
            },
        ];
        assemble_update(
            &ctx(StatementKind::Set(assigns)),
            0,
            &mut session,
            pg(),
            &back_tx,
        )
        .unwrap();

        let mut messages = Vec::new();
        while let Ok(response) = back_rx.try_recv() {
            if let BackendResponse::Message { message, .. } = response {
                messages.push(message);
            }
        }
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], PgWireBackendMessage::CommandComplete(_)));
        assert!(matches!(messages[1], PgWireBackendMessage::ParameterStatus(_)));
        assert!(matches!(messages[2], PgWireBackendMessage::ParameterStatus(_)));
        assert!(encoded(messages.remove(1)).contains("quay"));
    }

    #[test]
    fn commit_closes_all_portals_and_emits_no_row_description() {
        use std::sync::Arc;

        use crate::{portal::Portal, statement::PreparedStatement};

        let (back_tx, mut back_rx) = tokio::sync::mpsc::channel(16);
        let mut session = Session::default();
        session.txn = TransactionStatus::InBlock;
        let stmt = Arc::new(PreparedStatement::new(
            "s1",
            ctx(StatementKind::Select),
            &[],
        ));
        session
            .portals
            .add(Portal::new("p1", stmt, vec![], vec![]));

        assemble_update(&ctx(StatementKind::Commit), 0, &mut session, pg(), &back_tx).unwrap();

        assert!(session.portals.is_empty());
        assert_eq!(session.txn, TransactionStatus::Idle);

        let mut messages = Vec::new();
        while let Ok(response) = back_rx.try_recv() {
            if let BackendResponse::Message { message, .. } = response {
                messages.push(message);
            }
        }
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], PgWireBackendMessage::CommandComplete(_)));
        assert!(!messages
            .iter()
            .any(|m| matches!(m, PgWireBackendMessage::RowDescription(_))));
    }

    #[test]
    fn empty_statement_answers_with_empty_query_response() {
        let (back_tx, mut back_rx) = tokio::sync::mpsc::channel(16);
        let mut session = Session::default();
        assemble_update(&ctx(StatementKind::Empty), 0, &mut session, pg(), &back_tx).unwrap();
        match back_rx.try_recv().unwrap() {
            BackendResponse::Message { message, .. } => {
                assert!(matches!(message, PgWireBackendMessage::EmptyQueryResponse(_)));
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn row_description_applies_single_format_to_every_column() {
        let columns = vec![
            ColumnDescription::new("id", Type::INT8),
            ColumnDescription::new("name", Type::TEXT),
        ];
        let fields = field_infos(&columns, &[FieldFormat::Binary]);
        assert_eq!(fields.len(), 2);
        assert!(fields.iter().all(|f| *f.format() == FieldFormat::Binary));
    }
}
