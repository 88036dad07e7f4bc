use std::path::PathBuf;

use docvault_core::commands::{self, restore::RestoreOptions};
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::cli::DomainArgs;
use crate::format::{format_date, join_or_dash};
use crate::signal::shutdown_flag;
use crate::table::{num_cell, TableTheme};

pub(crate) struct RestoreArgs<'a> {
    pub date: Option<i64>,
    pub merge: bool,
    pub recheck: bool,
    pub parallel: Option<usize>,
    pub history: Option<&'a str>,
    pub domains: &'a DomainArgs,
}

pub(crate) fn run_restore(config: &DocvaultConfig, args: RestoreArgs<'_>) -> CmdResult {
    let mut opts = RestoreOptions::from_config(config);
    opts.date = args.date;
    opts.merge = args.merge;
    opts.recheck = args.recheck;
    opts.filter = args.domains.into();
    if let Some(n) = args.parallel {
        if n == 0 {
            return Err("--parallel must be at least 1".into());
        }
        opts.parallel = n;
    }
    if let Some(path) = args.history {
        opts.history_file = Some(PathBuf::from(docvault_core::config::expand_tilde(path)));
    }

    let stats = commands::restore::run(config, &opts, Some(shutdown_flag()))
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    let theme = TableTheme::detect();
    let mut table = theme.new_data_table(&[
        "Domain",
        "Uploaded",
        "Unchanged",
        "Blobs",
        "Removed",
        "Unresolved",
    ]);
    for d in &stats.domains {
        table.add_row(vec![
            d.domain.as_str().into(),
            num_cell(d.uploaded),
            num_cell(d.unchanged),
            num_cell(d.blobs_uploaded),
            num_cell(d.removed),
            num_cell(d.unresolved.len()),
        ]);
    }
    if let Some(date) = stats.date {
        println!("Restored state as of {} ({date})", format_date(date));
    }
    println!("{table}");
    println!(
        "Uploaded {}, removed {}, unresolved {}",
        stats.uploaded(),
        stats.removed(),
        stats.unresolved()
    );

    for d in stats.domains.iter().filter(|d| !d.unresolved.is_empty()) {
        tracing::warn!(
            domain = %d.domain,
            "unresolved documents: {}",
            join_or_dash(&d.unresolved)
        );
    }

    let corrupt = stats.corrupt_archives();
    if !corrupt.is_empty() {
        println!("Undecodable archives: {}", corrupt.join(", "));
        println!("Run `docvault check` to repair the backup.");
    }

    if stats.canceled {
        return Err("restore interrupted; rerun to continue".into());
    }
    if !stats.success {
        return Err(format!(
            "restore incomplete, failed domains: {}",
            join_or_dash(&stats.failed_domains)
        )
        .into());
    }
    Ok(())
}
