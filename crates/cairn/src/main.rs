//! Cairn: a block-image tool over object storage.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cairn_core::Result;
use cairn_store::{ClassRegistry, MemStore};

mod cli;
mod commands;
mod progress;

use cli::{Cli, Commands, LockSubcommand, SnapSubcommand};
use commands::SnapOp;

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("cairn: {e}");
        // Exit with the positive errno of the failure.
        let code = (-e.errno()).clamp(1, 125);
        std::process::exit(code);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn store_path(data_dir: &PathBuf) -> PathBuf {
    data_dir.join("store.bin")
}

async fn run(cli: Cli) -> Result<()> {
    let global = &cli.global;

    if let Some(keyfile) = &global.keyfile {
        // The key only establishes the client identity for this process.
        let key = std::fs::read(keyfile)?;
        debug!(client = %global.id, key_bytes = key.len(), "loaded client key");
    }

    std::fs::create_dir_all(&global.data_dir)?;
    let path = store_path(&global.data_dir);
    let registry = Arc::new(ClassRegistry::with_builtins());
    let store = if path.exists() {
        Arc::new(MemStore::load(&path, registry)?)
    } else {
        Arc::new(MemStore::new(registry))
    };

    dispatch(&store, &cli).await?;
    store.save(&path)?;
    Ok(())
}

async fn dispatch(store: &Arc<MemStore>, cli: &Cli) -> Result<()> {
    let global = &cli.global;
    match &cli.command {
        Commands::List => commands::handle_list(store, global).await,
        Commands::Info(args) => commands::handle_info(store, global, args).await,
        Commands::Create(args) => commands::handle_create(store, global, args).await,
        Commands::Clone(args) => commands::handle_clone(store, global, args).await,
        Commands::Flatten(args) => commands::handle_flatten(store, global, args).await,
        Commands::Children(args) => commands::handle_children(store, global, args).await,
        Commands::Resize(args) => commands::handle_resize(store, global, args).await,
        Commands::Rm(args) => commands::handle_rm(store, global, args).await,
        Commands::Cp(args) => commands::handle_cp(store, global, args).await,
        Commands::Mv(args) => commands::handle_mv(store, global, args).await,
        Commands::Export(args) => commands::handle_export(store, global, args).await,
        Commands::Import(args) => commands::handle_import(store, global, args).await,
        Commands::ExportDiff(args) => commands::handle_export_diff(store, global, args).await,
        Commands::ImportDiff(args) => commands::handle_import_diff(store, global, args).await,
        Commands::MergeDiff(args) => commands::handle_merge_diff(args).await,
        Commands::Snap(cmd) => match &cmd.command {
            SnapSubcommand::Ls(args) => commands::handle_snap_ls(store, global, args).await,
            SnapSubcommand::Create(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Create).await
            }
            SnapSubcommand::Rollback(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Rollback).await
            }
            SnapSubcommand::Rm(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Rm).await
            }
            SnapSubcommand::Purge(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Purge).await
            }
            SnapSubcommand::Protect(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Protect).await
            }
            SnapSubcommand::Unprotect(args) => {
                commands::handle_snap_op(store, global, args, SnapOp::Unprotect).await
            }
        },
        Commands::Lock(cmd) => match &cmd.command {
            LockSubcommand::Ls(args) => commands::handle_lock_ls(store, global, args).await,
            LockSubcommand::Add(args) => commands::handle_lock_add(store, global, args).await,
            LockSubcommand::Rm(args) => commands::handle_lock_rm(store, global, args).await,
        },
        Commands::Watch(args) => commands::handle_watch(store, global, args).await,
        Commands::Status(args) => commands::handle_status(store, global, args).await,
        Commands::BenchWrite(args) => commands::handle_bench_write(store, global, args).await,
    }
}
