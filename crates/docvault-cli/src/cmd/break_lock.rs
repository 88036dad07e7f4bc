use docvault_core::config::DocvaultConfig;
use docvault_core::repo::lock;
use docvault_core::storage;

use super::CmdResult;

pub(crate) fn run_break_lock(config: &DocvaultConfig) -> CmdResult {
    let backend = storage::backend_from_url(&config.repository.url)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;
    let removed = lock::break_lock(backend.as_ref())
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })?;

    if removed == 0 {
        println!("No locks found.");
    } else {
        println!("Removed {removed} lock(s).");
    }
    Ok(())
}
