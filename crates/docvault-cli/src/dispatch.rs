use docvault_core::config::DocvaultConfig;

use crate::cli::Commands;
use crate::cmd::{self, restore::RestoreArgs, CmdResult};

pub(crate) fn dispatch_command(command: &Commands, cfg: &DocvaultConfig, verbose: bool) -> CmdResult {
    match command {
        Commands::Backup {
            force,
            full_verify,
            domains,
        } => cmd::backup::run_backup(cfg, *force, *full_verify, domains),
        Commands::List => cmd::list::run_list(cfg, verbose),
        Commands::Restore {
            date,
            merge,
            recheck,
            parallel,
            history,
            domains,
        } => cmd::restore::run_restore(
            cfg,
            RestoreArgs {
                date: *date,
                merge: *merge,
                recheck: *recheck,
                parallel: *parallel,
                history: history.as_deref(),
                domains,
            },
        ),
        Commands::Compact {
            force,
            blob_limit,
            skip_type,
        } => cmd::compact::run_compact(cfg, *force, blob_limit.as_deref(), skip_type),
        Commands::Check { dry_run } => cmd::check::run_check(cfg, *dry_run),
        Commands::Size => cmd::size::run_size(cfg),
        Commands::Download { dest, domains } => cmd::download::run_download(cfg, dest, domains),
        Commands::Find { id } => cmd::find::run_find(cfg, id),
        Commands::Prune { since } => cmd::prune::run_prune(cfg, *since),
        Commands::BreakLock => cmd::break_lock::run_break_lock(cfg),
        Commands::Config { .. } => Err("`config` does not take a loaded configuration".into()),
    }
}
