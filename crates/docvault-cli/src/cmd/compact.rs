use docvault_core::commands::{self, compact::CompactOptions};
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::format::parse_size;
use crate::signal::shutdown_flag;
use crate::table::{add_kv_row, TableTheme};

pub(crate) fn run_compact(
    config: &DocvaultConfig,
    force: bool,
    blob_limit: Option<&str>,
    skip_types: &[String],
) -> CmdResult {
    let mut opts = CompactOptions::from_config(config)?;
    opts.force = force;
    if let Some(limit) = blob_limit {
        opts.blob_policy.size_limit = Some(parse_size(limit)?);
    }
    if !skip_types.is_empty() {
        opts.blob_policy.skip_content_types = skip_types.to_vec();
    }

    let stats = commands::compact::run(config, &opts, Some(shutdown_flag()))
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if stats.skipped {
        println!("Nothing to compact.");
        return Ok(());
    }

    let theme = TableTheme::detect();
    let mut table = theme.new_kv_table();
    if stats.resumed {
        add_kv_row(&mut table, theme, "Resumed", "yes");
    }
    add_kv_row(&mut table, theme, "Snapshots merged", stats.snapshots_merged);
    add_kv_row(&mut table, theme, "Documents written", stats.documents_written);
    add_kv_row(&mut table, theme, "Blobs dropped", stats.blobs_dropped);
    add_kv_row(&mut table, theme, "Files deleted", stats.files_deleted);
    if stats.unresolved > 0 {
        add_kv_row(&mut table, theme, "Unresolved", stats.unresolved);
    }
    println!("{table}");
    for name in &stats.corrupt_archives {
        println!("  dropped undecodable archive: {name}");
    }
    Ok(())
}
