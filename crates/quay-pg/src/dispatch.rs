//! Classification of inbound frames into executable commands, including
//! detection of batch-eligible bind/execute runs inside a pipelined group.

use bytes::Bytes;
use compact_str::CompactString;
use pgwire::messages::PgWireFrontendMessage;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryData {
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseData {
    pub name: CompactString,
    pub query: String,
    pub type_oids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindData {
    pub portal: CompactString,
    pub statement: CompactString,
    pub param_formats: Vec<i16>,
    pub parameters: Vec<Option<Bytes>>,
    pub result_formats: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescribeData {
    /// Raw target byte from the wire: `b'S'` statement, `b'P'` portal.
    pub target: u8,
    pub name: CompactString,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteData {
    pub name: CompactString,
    pub max_rows: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseData {
    pub target: u8,
    pub name: CompactString,
}

/// One executable unit. Every inbound frame maps to exactly one command; a
/// batch-eligible sub-range maps to a single `Batched` command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SimpleQuery(QueryData),
    Parse(ParseData),
    Bind(BindData),
    Describe(DescribeData),
    Execute(ExecuteData),
    Sync,
    Close(CloseData),
    Flush,
    Terminate,
    /// Client message this proxy does not serve; answered with a minimal
    /// feature-not-supported response so the pipeline never hangs.
    Unsupported(&'static str),
    /// Startup after the handshake is a protocol violation.
    UnexpectedStartup,
    Batched(Vec<Command>),
}

fn classify(msg: PgWireFrontendMessage) -> Command {
    match msg {
        PgWireFrontendMessage::Query(query) => {
            debug!("dispatch simple query, sql: {}", query.query());
            Command::SimpleQuery(QueryData {
                sql: query.query().clone(),
            })
        }
        PgWireFrontendMessage::Parse(parse) => {
            debug!("dispatch parse, sql: {}", parse.query());
            Command::Parse(ParseData {
                name: parse.name().as_deref().unwrap_or("").into(),
                query: parse.query().clone(),
                type_oids: parse.type_oids().clone(),
            })
        }
        PgWireFrontendMessage::Bind(bind) => Command::Bind(BindData {
            portal: bind.portal_name().as_deref().unwrap_or("").into(),
            statement: bind.statement_name().as_deref().unwrap_or("").into(),
            param_formats: bind.parameter_format_codes().clone(),
            parameters: bind.parameters().clone(),
            result_formats: bind.result_column_format_codes().clone(),
        }),
        PgWireFrontendMessage::Describe(describe) => Command::Describe(DescribeData {
            target: describe.target_type(),
            name: describe.name().as_deref().unwrap_or("").into(),
        }),
        PgWireFrontendMessage::Execute(execute) => Command::Execute(ExecuteData {
            name: execute.name().as_deref().unwrap_or("").into(),
            max_rows: *execute.max_rows(),
        }),
        PgWireFrontendMessage::Sync(_) => Command::Sync,
        PgWireFrontendMessage::Close(close) => Command::Close(CloseData {
            target: close.target_type(),
            name: close.name().as_deref().unwrap_or("").into(),
        }),
        PgWireFrontendMessage::Flush(_) => Command::Flush,
        PgWireFrontendMessage::Terminate(_) => Command::Terminate,
        PgWireFrontendMessage::Startup(_) => Command::UnexpectedStartup,
        PgWireFrontendMessage::PasswordMessageFamily(_) => Command::Unsupported("PasswordMessage"),
        PgWireFrontendMessage::CopyData(_) => Command::Unsupported("CopyData"),
        PgWireFrontendMessage::CopyFail(_) => Command::Unsupported("CopyFail"),
        PgWireFrontendMessage::CopyDone(_) => Command::Unsupported("CopyDone"),
    }
}

/// An ordered group of frames delivered together by client pipelining, with
/// the batch-eligible sub-range detected at construction.
pub struct AggregatedPacket {
    commands: Vec<Command>,
    batch_range: Option<(usize, usize)>,
}

impl AggregatedPacket {
    pub fn new(frames: Vec<PgWireFrontendMessage>) -> Self {
        Self::from_commands(frames.into_iter().map(classify).collect())
    }

    pub fn from_commands(commands: Vec<Command>) -> Self {
        let batch_range = find_batch_range(&commands);
        Self {
            commands,
            batch_range,
        }
    }

    pub fn contains_batched_statements(&self) -> bool {
        self.batch_range.is_some()
    }

    pub fn batch_range(&self) -> Option<(usize, usize)> {
        self.batch_range
    }

    /// Produces the executable units in arrival order: commands before the
    /// batch range individually, the range as one batched command, commands
    /// after it individually.
    pub fn into_commands(self) -> Vec<Command> {
        let Some((begin, end)) = self.batch_range else {
            return self.commands;
        };
        let mut result = Vec::with_capacity(self.commands.len());
        let mut batch = Vec::with_capacity(end - begin + 1);
        for (i, command) in self.commands.into_iter().enumerate() {
            if i < begin || i > end {
                result.push(command);
            } else {
                batch.push(command);
                if i == end {
                    result.push(Command::Batched(std::mem::take(&mut batch)));
                }
            }
        }
        result
    }
}

/// Finds a contiguous run of Bind(+optional Describe)+Execute units anchored
/// at the first Bind, all naming the same statement. At least two Bind frames
/// make the run batch-eligible; a trailing Bind without its Execute stays
/// outside the range.
fn find_batch_range(commands: &[Command]) -> Option<(usize, usize)> {
    let (begin, statement) = commands.iter().enumerate().find_map(|(i, c)| match c {
        Command::Bind(bind) => Some((i, bind.statement.clone())),
        _ => None,
    })?;

    let mut bind_count = 0usize;
    let mut end = None;
    let mut i = begin;
    while i < commands.len() {
        match &commands[i] {
            Command::Bind(bind) if bind.statement == statement => {}
            _ => break,
        }
        let mut j = i + 1;
        if matches!(commands.get(j), Some(Command::Describe(_))) {
            j += 1;
        }
        if !matches!(commands.get(j), Some(Command::Execute(_))) {
            break;
        }
        bind_count += 1;
        end = Some(j);
        i = j + 1;
    }

    match end {
        Some(end) if bind_count >= 2 => Some((begin, end)),
        _ => None,
    }
}
