use docvault_core::commands;
use docvault_core::config::DocvaultConfig;

use super::CmdResult;
use crate::format::format_date;
use crate::table::TableTheme;

pub(crate) fn run_find(config: &DocvaultConfig, id: &str) -> CmdResult {
    let found = commands::find::run(config, id)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if found.versions.is_empty() {
        println!("No versions of '{id}' found.");
        return Ok(());
    }

    let theme = TableTheme::detect();
    let mut table = theme.new_data_table(&["Date", "Domain", "Change", "Hash", "Archive"]);
    for v in &found.versions {
        table.add_row(vec![
            format_date(v.date),
            v.domain.clone(),
            v.change.as_str().to_string(),
            if v.hash.is_empty() { "-".into() } else { v.hash.clone() },
            v.archive.clone().unwrap_or_else(|| "-".into()),
        ]);
    }
    println!("{table}");

    match &found.latest {
        Some(value) => {
            println!();
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        None => println!("Latest version: removed"),
    }
    Ok(())
}
