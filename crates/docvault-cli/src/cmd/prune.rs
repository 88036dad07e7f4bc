use docvault_core::commands;
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::format::format_date;

pub(crate) fn run_prune(config: &DocvaultConfig, since: i64) -> CmdResult {
    let stats = commands::prune::run(config, since)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if stats.snapshots_removed == 0 {
        println!("No snapshots at or after {}.", format_date(since));
    } else {
        println!(
            "Removed {} snapshot(s) and {} file(s); {} snapshot(s) kept.",
            stats.snapshots_removed, stats.files_deleted, stats.snapshots_kept
        );
    }
    Ok(())
}
