pub mod clock;
pub mod codec;
pub mod commands;
pub mod config;
pub mod events;
pub mod forest;
pub mod logging;
pub mod migration;
pub mod models;
pub mod report;
pub mod settings;
pub mod sqlite;
pub mod state;
pub mod storage;
pub mod writer;

pub use models::{Priority, Subtask, Task, TaskStatus, Timestamp};
pub use state::{StoreError, StoreOptions, TaskStore, WriteMode};
pub use storage::{Storage, StorageError};

#[cfg(all(feature = "app", not(test)))]
mod cli {
    use std::io::{BufRead, Write};
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::Context;
    use clap::Parser;

    use crate::clock::SystemClock;
    use crate::commands::{
        execute, execute_line, status_line, Command, CommandCtx, CommandResult, Reply,
    };
    use crate::config::{AppConfig, BackendKind};
    use crate::events::StatePayload;
    use crate::logging::init_logging;
    use crate::state::{StoreOptions, TaskStore, WriteMode};

    const PROMPT_HINT: &str = "!theme, !report, !clear, !s [ID] [text]";

    #[derive(Parser, Debug)]
    #[command(
        author,
        version,
        about = "daily-plan: task tracker with daily rollover",
        long_about = None
    )]
    struct Cli {
        /// Directory holding the task, settings and log files.
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,

        /// Storage backend: sqlite or file.
        #[arg(long, value_name = "KIND")]
        backend: Option<BackendKind>,

        /// Roll yesterday's unfinished tasks forward before anything else.
        #[arg(long)]
        migrate: bool,

        /// Emit JSON command results instead of text.
        #[arg(long)]
        json: bool,

        /// Run one input line and exit, e.g. `daily-plan "buy milk [high]"`.
        input: Vec<String>,
    }

    struct CliCtx {
        store: TaskStore,
        json: bool,
    }

    impl CommandCtx for CliCtx {
        fn store(&self) -> &TaskStore {
            &self.store
        }

        fn emit_state_updated(&self, payload: StatePayload) {
            log::debug!(
                "state updated: {} tasks, {} pending, theme {}",
                payload.tasks.len(),
                payload.pending,
                payload.theme
            );
        }
    }

    impl CliCtx {
        fn print(&self, result: &CommandResult<Reply>) -> anyhow::Result<()> {
            let mut out = std::io::stdout().lock();
            if self.json {
                writeln!(out, "{}", serde_json::to_string(result)?)?;
                return Ok(());
            }
            match (&result.data, &result.error) {
                (Some(reply), _) => {
                    let text = reply.render();
                    if !text.is_empty() {
                        writeln!(out, "{text}")?;
                    }
                }
                (None, Some(error)) => writeln!(out, "error: {error}")?,
                (None, None) => {}
            }
            Ok(())
        }
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        let config = AppConfig::from_env(cli.data_dir.clone(), cli.backend)?;
        if let Err(error) = init_logging(&config.data_dir) {
            eprintln!("logging disabled: {error}");
        }
        log::info!(
            "starting data_dir={} backend={}",
            config.data_dir.display(),
            config.backend
        );

        let storage = config.open_storage().with_context(|| {
            format!(
                "opening {} storage in {}",
                config.backend,
                config.data_dir.display()
            )
        })?;
        let store = TaskStore::open_with(
            storage,
            StoreOptions {
                clock: Arc::new(SystemClock),
                write_mode: WriteMode::Queued,
            },
        )?;
        let ctx = CliCtx {
            store,
            json: cli.json,
        };

        if cli.migrate {
            ctx.print(&execute(&ctx, Command::Migrate))?;
        }

        if !cli.input.is_empty() {
            let result = execute_line(&ctx, &cli.input.join(" "));
            ctx.print(&result)?;
            ctx.store.flush()?;
            if let Some(error) = result.error {
                anyhow::bail!(error);
            }
            return Ok(());
        }

        repl(&ctx)?;
        ctx.store.flush()?;
        log::info!("bye");
        Ok(())
    }

    fn repl(ctx: &CliCtx) -> anyhow::Result<()> {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            {
                let mut out = std::io::stdout().lock();
                write!(
                    out,
                    "{} | {PROMPT_HINT}\n> ",
                    status_line(ctx.store.pending_count())
                )?;
                out.flush()?;
            }
            let Some(line) = lines.next() else {
                return Ok(());
            };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let result = execute_line(ctx, &line);
            if matches!(result.data, Some(Reply::Exit)) {
                return Ok(());
            }
            ctx.print(&result)?;
        }
    }
}

#[cfg(all(feature = "app", not(test)))]
pub use cli::run;
