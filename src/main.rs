//! Purpose: `cabinite` CLI entry point and command bootstrap.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit stable stdout formats (human or JSON by stream).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All record mutations go through `api::Store` (locks + atomic persist).
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use cabinite::api::{
    ContainerHandle, ContainerInfo, Error, ErrorKind, Key, Store, TableSpec, to_exit_code,
};
use cabinite::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = err
                    .to_string()
                    .lines()
                    .next()
                    .unwrap_or("invalid arguments")
                    .to_string();
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(message)
                    .with_hint("Run `cabinite --help` for usage."));
            }
        },
    };

    let store_dir = cli.dir.unwrap_or_else(default_store_dir);
    command_dispatch::dispatch_command(cli.command, store_dir)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn default_store_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".cabinite").join("store")
}

#[derive(Parser)]
#[command(
    name = "cabinite",
    version,
    about = "Embedded versioned JSON record store",
    before_help = r#"Containers hold tables of JSON records keyed by a primary-key field.

Mental model:
  - `add` / `put` write records (insert / insert-or-replace)
  - `get` / `list` / `each` read records
  - schema changes happen only through `container create` / `container upgrade`
"#,
    after_help = r#"EXAMPLES
  $ cabinite container create learns --table students
  $ cabinite add learns students --data-json '{"name": "Alice", "age": 30}'
  $ cabinite get learns students 1719300000000
  $ cabinite list learns students

LEARN MORE
  $ cabinite <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Store directory for containers (default: ~/.cabinite/store)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Manage containers",
        after_help = r#"EXAMPLES
  $ cabinite container create learns --table students --table courses=code
  $ cabinite container upgrade learns --container-version 2 --table teachers=badge
  $ cabinite container info learns
  $ cabinite container list

NOTES
  - Default location: ~/.cabinite/store (override with --dir)
  - Tables are created only by create/upgrade and never altered afterwards"#
    )]
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    #[command(
        about = "Insert a record (fails if its key already exists)",
        after_help = r#"EXAMPLES
  $ cabinite add learns students --data-json '{"id": "s1", "name": "Alice"}'
  $ cabinite add learns students --data-json '{"name": "Bob"}'   # key is generated

NOTES
  - Every field present must be non-empty
  - A record without the table's key field gets a generated millisecond id"#
    )]
    Add {
        container: String,
        table: String,
        #[arg(long = "data-json", help = "Record as a JSON object")]
        data_json: String,
    },
    #[command(about = "Fetch a record by primary key")]
    Get {
        container: String,
        table: String,
        key: String,
    },
    #[command(about = "Insert or replace a record (key field required)")]
    Put {
        container: String,
        table: String,
        #[arg(long = "data-json", help = "Record as a JSON object")]
        data_json: String,
    },
    #[command(about = "Delete a record by primary key (succeeds when absent)")]
    Delete {
        container: String,
        table: String,
        key: String,
    },
    #[command(about = "Remove every record in a table")]
    Clear { container: String, table: String },
    #[command(about = "List every record in ascending key order")]
    List { container: String, table: String },
    #[command(about = "Stream records as JSONL in ascending key order")]
    Each { container: String, table: String },
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ContainerCommand {
    #[command(about = "Create (or open) a container at a schema version")]
    Create {
        name: String,
        #[arg(
            long = "container-version",
            default_value_t = 1,
            help = "Schema version (positive integer)"
        )]
        version: u32,
        #[arg(
            long = "table",
            value_parser = parse_table_spec,
            help = "Table spec `name` or `name=key_field` (repeatable; key field defaults to `id`)"
        )]
        table: Vec<TableSpec>,
    },
    #[command(about = "Upgrade a container to a newer version, creating missing tables")]
    Upgrade {
        name: String,
        #[arg(long = "container-version", help = "New schema version")]
        version: u32,
        #[arg(long = "table", value_parser = parse_table_spec)]
        table: Vec<TableSpec>,
    },
    #[command(about = "Show container schema and record counts")]
    Info { name: String },
    #[command(about = "List containers in the store directory")]
    List,
}

fn parse_table_spec(raw: &str) -> Result<TableSpec, String> {
    let (name, key_field) = match raw.split_once('=') {
        Some((name, key_field)) => (name, Some(key_field)),
        None => (raw, None),
    };
    if name.is_empty() {
        return Err("table name must not be empty".to_string());
    }
    let spec = TableSpec::new(name);
    Ok(match key_field {
        Some(key_field) => spec.with_key_field(key_field),
        None => spec,
    })
}

async fn open_and_report(
    store: &Store,
    name: &str,
    version: u32,
    specs: &[TableSpec],
) -> Result<RunOutcome, Error> {
    let handle = store.open(name, version, specs).await?;
    let info = handle.info().await?;
    emit_json(container_info_json(name, &info));
    Ok(RunOutcome::ok())
}

async fn run_container_command(
    store: &Store,
    command: ContainerCommand,
) -> Result<RunOutcome, Error> {
    match command {
        ContainerCommand::Create {
            name,
            version,
            table,
        } => open_and_report(store, &name, version, &table).await,
        ContainerCommand::Upgrade {
            name,
            version,
            table,
        } => open_and_report(store, &name, version, &table).await,
        ContainerCommand::Info { name } => {
            let handle = store.open_existing(&name).await?;
            let info = handle.info().await?;
            emit_json(container_info_json(&name, &info));
            Ok(RunOutcome::ok())
        }
        ContainerCommand::List => {
            let mut containers = Vec::new();
            for name in store.container_names()? {
                let handle = store.open_existing(&name).await?;
                let info = handle.info().await?;
                containers.push(container_info_json(&name, &info));
                store.close(&name, handle.version()).await;
            }
            emit_json(json!({ "containers": containers }));
            Ok(RunOutcome::ok())
        }
    }
}

async fn run_add(
    store: &Store,
    container: &str,
    table: &str,
    data_json: &str,
) -> Result<RunOutcome, Error> {
    let record = parse_record(data_json)?;
    validate_record_fields(&record)?;
    let handle = store.open_existing(container).await?;
    let record = ensure_record_key(&handle, container, table, record).await?;
    let key = handle.add(table, record.clone()).await?;
    emit_json(json!({
        "container": container,
        "table": table,
        "key": key.to_value(),
        "record": record,
    }));
    Ok(RunOutcome::ok())
}

async fn run_get(
    store: &Store,
    container: &str,
    table: &str,
    key: &str,
) -> Result<RunOutcome, Error> {
    let record_key = Key::parse(key);
    let handle = store.open_existing(container).await?;
    match handle.get(table, record_key.clone()).await? {
        Some(record) => {
            emit_json(record);
            Ok(RunOutcome::ok())
        }
        None => Err(Error::new(ErrorKind::NotFound)
            .with_message("no record with that key")
            .with_table(table)
            .with_key(record_key.to_string())),
    }
}

async fn run_put(
    store: &Store,
    container: &str,
    table: &str,
    data_json: &str,
) -> Result<RunOutcome, Error> {
    let record = parse_record(data_json)?;
    validate_record_fields(&record)?;
    let handle = store.open_existing(container).await?;
    let key = handle.put(table, record.clone()).await?;
    emit_json(json!({
        "container": container,
        "table": table,
        "key": key.to_value(),
        "record": record,
    }));
    Ok(RunOutcome::ok())
}

async fn run_delete(
    store: &Store,
    container: &str,
    table: &str,
    key: &str,
) -> Result<RunOutcome, Error> {
    let record_key = Key::parse(key);
    let handle = store.open_existing(container).await?;
    let deleted = handle.delete(table, record_key.clone()).await?;
    emit_json(json!({
        "container": container,
        "table": table,
        "key": record_key.to_value(),
        "deleted": deleted,
    }));
    Ok(RunOutcome::ok())
}

async fn run_clear(store: &Store, container: &str, table: &str) -> Result<RunOutcome, Error> {
    let handle = store.open_existing(container).await?;
    handle.clear(table).await?;
    emit_json(json!({
        "container": container,
        "table": table,
        "cleared": true,
    }));
    Ok(RunOutcome::ok())
}

async fn run_list(store: &Store, container: &str, table: &str) -> Result<RunOutcome, Error> {
    let handle = store.open_existing(container).await?;
    let records = handle.get_all(table).await?;
    emit_json(Value::Array(records));
    Ok(RunOutcome::ok())
}

async fn run_each(store: &Store, container: &str, table: &str) -> Result<RunOutcome, Error> {
    let handle = store.open_existing(container).await?;
    handle
        .each(table, |record| {
            println!("{record}");
        })
        .await?;
    Ok(RunOutcome::ok())
}

fn parse_record(data_json: &str) -> Result<Value, Error> {
    let record: Value = serde_json::from_str(data_json).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("record must be valid JSON")
            .with_source(err)
    })?;
    if !record.is_object() {
        return Err(Error::new(ErrorKind::Usage).with_message("record must be a JSON object"));
    }
    Ok(record)
}

// Mirrors the form-style input check: a submitted record may not carry empty fields.
fn validate_record_fields(record: &Value) -> Result<(), Error> {
    let Some(object) = record.as_object() else {
        return Err(Error::new(ErrorKind::Usage).with_message("record must be a JSON object"));
    };
    for (field, value) in object {
        let empty = match value {
            Value::String(text) => text.is_empty(),
            Value::Null => true,
            _ => false,
        };
        if empty {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("field `{field}` must not be empty"))
                .with_hint("Fill in every field before submitting the record."));
        }
    }
    Ok(())
}

/// Records submitted without the table's key field get a generated
/// millisecond-epoch id, reported as a stderr notice.
async fn ensure_record_key(
    handle: &ContainerHandle,
    container: &str,
    table: &str,
    mut record: Value,
) -> Result<Value, Error> {
    let info = handle.info().await?;
    let Some(table_info) = info.tables.iter().find(|t| t.name == table) else {
        // Unknown table: let the engine report it.
        return Ok(record);
    };
    if record.get(&table_info.key_field).is_some() {
        return Ok(record);
    }

    let generated = millis_since_epoch().to_string();
    if let Some(object) = record.as_object_mut() {
        object.insert(table_info.key_field.clone(), Value::from(generated.clone()));
    }
    let mut details = Map::new();
    details.insert("key".to_string(), Value::from(generated));
    details.insert(
        "key_field".to_string(),
        Value::from(table_info.key_field.clone()),
    );
    emit_notice(&Notice {
        kind: "generated-key".to_string(),
        time: notice_time_now().unwrap_or_default(),
        cmd: "add".to_string(),
        container: container.to_string(),
        message: "generated a primary key for the record".to_string(),
        details,
    });
    Ok(record)
}

fn millis_since_epoch() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default()
}

fn notice_time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn container_info_json(name: &str, info: &ContainerInfo) -> Value {
    json!({
        "container": {
            "name": name,
            "version": info.schema_version,
            "tables": info
                .tables
                .iter()
                .map(|table| {
                    json!({
                        "name": table.name,
                        "key_field": table.key_field,
                        "records": table.records,
                    })
                })
                .collect::<Vec<_>>(),
        }
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    } else {
        serde_json::to_string(&value)
            .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    };
    println!("{json}");
}

fn emit_notice(notice: &Notice) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {} (container: {})", notice.message, notice.container);
        return;
    }
    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        let mut text = format!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            text.push_str(&format!("\nhint: {hint}"));
        }
        eprintln!("{text}");
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Constraint => "constraint violation".to_string(),
        ErrorKind::Open => "failed to open container".to_string(),
        ErrorKind::Transaction => "operation failed".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
