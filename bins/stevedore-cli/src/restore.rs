// pg_restore invocation for the database container
use stevedore_common::types::ExecSpec;

pub const DEFAULT_CONTAINER: &str = "postgres-db";
pub const DEFAULT_DUMP_FILE: &str = "/dbDumpFile/postgres.tar";
pub const DEFAULT_PG_PORT: &str = "5432";

/// Connection settings handed to pg_restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// `bash -c` script that restores `dump_file` into the configured database.
/// The password travels as `PGPASSWORD` so it never appears in argv.
pub fn restore_command(pg: &PgSettings, dump_file: &str) -> ExecSpec {
    let script = format!(
        "PGPASSWORD={} pg_restore --verbose --clean --no-acl --no-owner -h {} -p {} -U {} -d {} {}",
        shell_quote(&pg.password),
        shell_quote(&pg.host),
        pg.port,
        shell_quote(&pg.user),
        shell_quote(&pg.database),
        shell_quote(dump_file),
    );
    ExecSpec::shell(script)
}

/// Single-quote for bash, closing and reopening around embedded quotes
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
