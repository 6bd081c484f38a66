use crate::statement::StatementKind;

/// Dialect-specific formatting for a PostgreSQL-family database. Resolved
/// once at server construction and consumed read-only afterwards.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Version string reported in the startup `server_version` parameter.
    fn server_version(&self) -> &'static str;

    /// Command-complete tag verb for a statement class; `None` tags as the
    /// empty string.
    fn command_tag(&self, kind: &StatementKind) -> Option<&'static str>;
}

fn common_command_tag(kind: &StatementKind) -> Option<&'static str> {
    match kind {
        StatementKind::Select => Some("SELECT"),
        StatementKind::Insert => Some("INSERT"),
        StatementKind::Update => Some("UPDATE"),
        StatementKind::Delete => Some("DELETE"),
        StatementKind::Create => Some("CREATE"),
        StatementKind::Drop => Some("DROP"),
        StatementKind::Alter => Some("ALTER"),
        StatementKind::Begin => Some("BEGIN"),
        StatementKind::Commit => Some("COMMIT"),
        StatementKind::Rollback => Some("ROLLBACK"),
        StatementKind::Set(_) => Some("SET"),
        StatementKind::Empty | StatementKind::Other => None,
    }
}

pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn server_version(&self) -> &'static str {
        "14.0.0"
    }

    fn command_tag(&self, kind: &StatementKind) -> Option<&'static str> {
        common_command_tag(kind)
    }
}

/// PostgreSQL-compatible dialect; same wire protocol, its own identity.
pub struct Kingbase;

impl Dialect for Kingbase {
    fn name(&self) -> &'static str {
        "kingbase"
    }

    fn server_version(&self) -> &'static str {
        "12.1.0"
    }

    fn command_tag(&self, kind: &StatementKind) -> Option<&'static str> {
        common_command_tag(kind)
    }
}

static POSTGRES: Postgres = Postgres;
static KINGBASE: Kingbase = Kingbase;

/// Looks a dialect up by name, case-insensitively.
pub fn lookup(name: &str) -> Option<&'static dyn Dialect> {
    match name.to_ascii_lowercase().as_str() {
        "postgresql" | "postgres" => Some(&POSTGRES),
        "kingbase" => Some(&KINGBASE),
        _ => None,
    }
}
