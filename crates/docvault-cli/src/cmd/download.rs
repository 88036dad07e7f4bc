use std::path::Path;

use docvault_core::commands;
use docvault_core::config::{self, DocvaultConfig};

use super::CmdResult;
use crate::cli::DomainArgs;
use crate::format::format_bytes;

pub(crate) fn run_download(config: &DocvaultConfig, dest: &str, domains: &DomainArgs) -> CmdResult {
    let dest = config::expand_tilde(dest);
    let stats = commands::download::run(config, Path::new(&dest), &domains.into())
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    println!(
        "Downloaded {} file(s), {} ({} already present) to {dest}",
        stats.files_copied,
        format_bytes(stats.bytes_copied),
        stats.files_skipped,
    );
    Ok(())
}
