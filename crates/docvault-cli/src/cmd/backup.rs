use docvault_core::commands::{self, backup::BackupOptions};
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::cli::DomainArgs;
use crate::format::{format_bytes, format_date, join_or_dash};
use crate::signal::shutdown_flag;
use crate::table::{add_kv_row, TableTheme};

pub(crate) fn run_backup(
    config: &DocvaultConfig,
    force: bool,
    full_verify: bool,
    domains: &DomainArgs,
) -> CmdResult {
    let mut opts = BackupOptions::from_config(config)?;
    opts.force = force;
    opts.full_verify = full_verify;
    opts.filter = domains.into();

    let result = commands::backup::run(config, &opts, Some(shutdown_flag()))
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if result.skipped {
        println!("Workspace unchanged since the last backup; nothing to do.");
        return Ok(());
    }

    let theme = TableTheme::detect();
    let mut table = theme.new_kv_table();
    let snapshot = result
        .snapshot_date
        .map(|ms| format!("{} ({ms})", format_date(ms)))
        .unwrap_or_else(|| "none (no changes)".to_string());
    add_kv_row(&mut table, theme, "Snapshot", snapshot);
    add_kv_row(
        &mut table,
        theme,
        "Domains",
        format!(
            "{} processed, {} unchanged",
            result.domains_processed, result.domains_unchanged
        ),
    );
    add_kv_row(&mut table, theme, "Added", result.added);
    add_kv_row(&mut table, theme, "Updated", result.updated);
    add_kv_row(&mut table, theme, "Removed", result.removed);
    if result.skipped_blobs > 0 {
        add_kv_row(&mut table, theme, "Skipped blobs", result.skipped_blobs);
    }
    add_kv_row(&mut table, theme, "Backup size", format_bytes(result.backup_size));
    if result.compacted {
        add_kv_row(&mut table, theme, "Compacted", "yes");
    }
    if !result.failed_domains.is_empty() {
        add_kv_row(
            &mut table,
            theme,
            "Failed domains",
            join_or_dash(&result.failed_domains),
        );
    }
    println!("{table}");

    if result.canceled {
        return Err("backup interrupted; completed domains were saved".into());
    }
    if !result.success {
        return Err(format!(
            "backup incomplete: {} domain(s) failed",
            result.failed_domains.len()
        )
        .into());
    }
    Ok(())
}
