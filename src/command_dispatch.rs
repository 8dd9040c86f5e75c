//! Purpose: Hold top-level CLI command dispatch for `cabinite`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Command behavior, output envelopes, and exit code semantics stay unchanged.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(command: Command, store_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cabinite", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(run_command(command, store_dir))
        }
    }
}

async fn run_command(command: Command, store_dir: PathBuf) -> Result<RunOutcome, Error> {
    let store = Store::new(store_dir);
    let outcome = match command {
        Command::Container { command } => run_container_command(&store, command).await,
        Command::Add {
            container,
            table,
            data_json,
        } => run_add(&store, &container, &table, &data_json).await,
        Command::Get {
            container,
            table,
            key,
        } => run_get(&store, &container, &table, &key).await,
        Command::Put {
            container,
            table,
            data_json,
        } => run_put(&store, &container, &table, &data_json).await,
        Command::Delete {
            container,
            table,
            key,
        } => run_delete(&store, &container, &table, &key).await,
        Command::Clear { container, table } => run_clear(&store, &container, &table).await,
        Command::List { container, table } => run_list(&store, &container, &table).await,
        Command::Each { container, table } => run_each(&store, &container, &table).await,
        Command::Completions { .. } => Err(Error::new(ErrorKind::Internal)
            .with_message("completions are dispatched before the runtime starts")),
    };
    store.close_all().await;
    outcome
}
