use docvault_core::commands;
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::format::format_date;
use crate::table::{num_cell, TableTheme};

pub(crate) fn run_list(config: &DocvaultConfig, verbose: bool) -> CmdResult {
    let snapshots = commands::list::run(config)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if snapshots.is_empty() {
        println!("No snapshots found.");
        return Ok(());
    }

    let theme = TableTheme::detect();
    let mut table = theme.new_data_table(&["Date", "ID", "Domains", "Archives", "Changes", ""]);
    for snapshot in &snapshots {
        table.add_row(vec![
            format_date(snapshot.date).into(),
            num_cell(snapshot.date),
            num_cell(snapshot.domains.len()),
            num_cell(snapshot.archives()),
            num_cell(snapshot.changes()),
            if snapshot.compacting {
                "compacting".into()
            } else {
                "".into()
            },
        ]);
    }
    println!("{table}");

    if verbose {
        for snapshot in &snapshots {
            println!();
            println!("{} ({})", format_date(snapshot.date), snapshot.date);
            let mut detail =
                theme.new_data_table(&["Domain", "Archives", "Digests", "Added", "Updated", "Removed"]);
            for d in &snapshot.domains {
                detail.add_row(vec![
                    d.domain.as_str().into(),
                    num_cell(d.archives),
                    num_cell(d.digests),
                    num_cell(d.added),
                    num_cell(d.updated),
                    num_cell(d.removed),
                ]);
            }
            println!("{detail}");
        }
    }
    Ok(())
}
