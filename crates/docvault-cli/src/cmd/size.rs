use docvault_core::commands;
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::format::format_bytes;
use crate::table::{add_kv_row, TableTheme};

pub(crate) fn run_size(config: &DocvaultConfig) -> CmdResult {
    let report = commands::info::run(config)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    let theme = TableTheme::detect();

    let mut t1 = theme.new_kv_table();
    add_kv_row(&mut t1, theme, "Repository", &config.repository.url);
    add_kv_row(&mut t1, theme, "Workspace", &report.workspace);
    add_kv_row(&mut t1, theme, "Format version", &report.version);
    println!("{t1}");
    println!();

    let mut t2 = theme.new_kv_table();
    add_kv_row(&mut t2, theme, "Snapshots", report.snapshot_count);
    let last = report
        .last_snapshot_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
    add_kv_row(&mut t2, theme, "Last snapshot", last);
    add_kv_row(&mut t2, theme, "Documents", format_bytes(report.sizes.data));
    add_kv_row(&mut t2, theme, "Blobs", format_bytes(report.sizes.blobs));
    add_kv_row(&mut t2, theme, "Total", format_bytes(report.sizes.total));
    if report.skipped_blobs > 0 {
        add_kv_row(
            &mut t2,
            theme,
            "Excluded blobs",
            format!(
                "{} ({})",
                report.skipped_blobs,
                format_bytes(report.skipped_blob_bytes)
            ),
        );
    }
    println!("{t2}");
    Ok(())
}
