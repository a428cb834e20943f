#![warn(clippy::all, clippy::dbg_macro)]

use std::process::ExitCode;

use anstream::{eprintln, println};
use anyhow::{Context as _, bail};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use maru2::fetch::FetchPolicy;
use maru2::inputs::With;
use maru2::uses::resolve;
use maru2::{Engine, Service, Store};

/// A YAML task runner.
#[derive(Parser)]
#[command(about, version)]
struct App {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more tasks from a workflow.
    Run {
        /// The workflow to load: a path, URL, purl, or alias reference.
        #[arg(short, long, default_value = "tasks.yaml")]
        file: String,

        /// Inputs for the task(s), as key=value pairs.
        #[arg(short = 'w', long = "with", value_name = "KEY=VALUE")]
        with: Vec<String>,

        /// When to hit sources vs. the local store.
        #[arg(long, value_enum)]
        fetch_policy: Option<FetchPolicy>,

        /// Print scripts and builtin previews without executing anything.
        #[arg(long)]
        dry_run: bool,

        /// Directory of the content store.
        #[arg(long, env = "MARU2_STORE")]
        store: Option<Utf8PathBuf>,

        /// The tasks to run, in order.
        tasks: Vec<String>,
    },

    /// List the tasks a workflow defines.
    List {
        /// The workflow to load.
        #[arg(short, long, default_value = "tasks.yaml")]
        file: String,
    },

    /// Pre-fetch a workflow's transitive dependencies into the store.
    FetchAll {
        /// The workflow to crawl.
        #[arg(short, long, default_value = "tasks.yaml")]
        file: String,

        /// Directory of the content store.
        #[arg(long, env = "MARU2_STORE")]
        store: Option<Utf8PathBuf>,
    },

    /// Publish workflows and their dependency closure as an OCI artifact.
    Publish {
        /// Destination reference, e.g. `ghcr.io/acme/tasks:v1`.
        #[arg(long)]
        to: String,

        /// Entrypoint workflow files.
        entrypoints: Vec<String>,
    },

    /// Inspect or clean the content store.
    Store {
        #[command(subcommand)]
        action: StoreAction,

        /// Directory of the content store.
        #[arg(long, env = "MARU2_STORE")]
        store: Option<Utf8PathBuf>,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List stored entries.
    List,
    /// Drop orphaned files and index entries.
    Gc,
    /// Drop everything.
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let app = App::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(app.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match run(app.command, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Run {
            file,
            with,
            fetch_policy,
            dry_run,
            store,
            tasks,
        } => {
            let config = maru2::config::load()?;
            let policy = fetch_policy.or(config.fetch_policy).unwrap_or_default();
            let aliases = config.aliases.clone();

            let svc = Service::new(policy, open_store(store)?, config.aliases)?;
            let engine = Engine::new(svc).dry_run(dry_run);

            let with = parse_with(&with)?;
            let target = resolve(None, &file, &aliases)?;
            let origin = target.without_task();

            let wf = engine.service().fetch_workflow(cancel, &origin).await?;
            engine.validate_workflow(&wf)?;

            let mut tasks = tasks;
            if tasks.is_empty() {
                tasks.push(target.task().unwrap_or("default").to_string());
            }

            let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?)
                .map_err(|p| anyhow::anyhow!("working directory is not UTF-8: {}", p.display()))?;

            for task in &tasks {
                if let Err(e) = engine.run(cancel, &wf, task, &with, &origin, &cwd).await {
                    for frame in e.frames() {
                        eprintln!("{}", frame.dimmed());
                    }
                    return Err(e.into());
                }
            }
            Ok(())
        }

        Command::List { file } => {
            let config = maru2::config::load()?;
            let aliases = config.aliases.clone();
            let svc = Service::new(
                config.fetch_policy.unwrap_or_default(),
                open_store(None)?,
                config.aliases,
            )?;

            let origin = resolve(None, &file, &aliases)?.without_task();
            let wf = svc.fetch_workflow(cancel, &origin).await?;

            for name in maru2_models::ordered_task_names(&wf) {
                let task = &wf.tasks[name];
                match &task.description {
                    Some(description) => println!("{}  {}", name.bold(), description.dimmed()),
                    None => println!("{}", name.bold()),
                }
                for (input, param) in &task.inputs {
                    let required = if param.is_required() && param.default.is_none() {
                        " (required)"
                    } else {
                        ""
                    };
                    println!("  -w {input}{required}");
                }
            }
            Ok(())
        }

        Command::FetchAll { file, store } => {
            let config = maru2::config::load()?;
            let aliases = config.aliases.clone();
            let svc = Service::new(FetchPolicy::Always, open_store(store)?, config.aliases)?;

            let origin = resolve(None, &file, &aliases)?.without_task();
            let wf = svc.fetch_workflow(cancel, &origin).await?;
            svc.fetch_all(cancel, &wf, &origin).await?;

            let count = svc.with_store(|store| store.list().len());
            println!("fetched {count} remote workflow(s)");
            Ok(())
        }

        Command::Publish { to, entrypoints } => {
            let config = maru2::config::load()?;
            maru2::publish::publish(cancel, &entrypoints, &to, config.aliases).await
        }

        Command::Store { action, store } => {
            let mut store = open_store(store)?;
            match action {
                StoreAction::List => {
                    for (id, entry) in store.list() {
                        println!(
                            "{}  {}  {}",
                            &entry.hex[..12],
                            entry.retrieved_at.to_rfc3339(),
                            id
                        );
                    }
                }
                StoreAction::Gc => {
                    let removed = store.gc()?;
                    println!("removed {removed} orphan(s)");
                }
                StoreAction::Clear => {
                    store.clear()?;
                    println!("store cleared");
                }
            }
            Ok(())
        }
    }
}

fn open_store(dir: Option<Utf8PathBuf>) -> anyhow::Result<Store> {
    let dir = match dir {
        Some(dir) => dir,
        None => Utf8PathBuf::from_path_buf(maru2::config::default_store_dir())
            .map_err(|p| anyhow::anyhow!("store directory is not UTF-8: {}", p.display()))?,
    };
    Store::open(dir).context("opening content store")
}

fn parse_with(pairs: &[String]) -> anyhow::Result<With> {
    let mut with = With::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --with `{pair}` (expected key=value)");
        };
        if with
            .insert(key.to_string(), serde_yaml::Value::String(value.to_string()))
            .is_some()
        {
            warn!("--with `{key}` given more than once; last wins");
        }
    }
    Ok(with)
}
