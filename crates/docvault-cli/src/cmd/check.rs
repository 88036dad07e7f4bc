use docvault_core::commands;
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::signal::shutdown_flag;
use crate::table::{add_kv_row, TableTheme};

pub(crate) fn run_check(config: &DocvaultConfig, dry_run: bool) -> CmdResult {
    let report = commands::check::run(config, dry_run, Some(shutdown_flag()))
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    let theme = TableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "Archives checked", report.archives_checked);
    add_kv_row(&mut table, theme, "Broken archives", report.archives_removed.len());
    add_kv_row(&mut table, theme, "Digests rewritten", report.digests_rewritten.len());
    add_kv_row(&mut table, theme, "Digests removed", report.digests_removed.len());
    add_kv_row(&mut table, theme, "Legacy digests converted", report.legacy_converted);
    add_kv_row(&mut table, theme, "Invalid ids", report.invalid_ids);
    add_kv_row(&mut table, theme, "Zero-sized files", report.zero_sized);
    add_kv_row(&mut table, theme, "Malformed files", report.malformed);
    println!("{table}");

    for name in report
        .archives_removed
        .iter()
        .chain(&report.digests_removed)
    {
        println!("  {}: {name}", if dry_run { "broken" } else { "removed" });
    }
    for name in &report.digests_rewritten {
        println!("  {}: {name}", if dry_run { "needs rewrite" } else { "rewritten" });
    }

    if report.is_clean() {
        println!("Backup is consistent.");
    } else if dry_run {
        println!("Problems found; run without --dry-run to repair.");
        return Err("check found problems".into());
    } else {
        println!(
            "Repaired {} domain(s); the next backup re-captures their documents.",
            report.repaired_domains.len()
        );
    }
    Ok(())
}
