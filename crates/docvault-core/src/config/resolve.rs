use std::fmt;
use std::path::{Path, PathBuf};

use super::types::DocvaultConfig;
use super::util::expand_tilde;
use crate::error::{DocvaultError, Result};
use crate::platform::paths;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "DOCVAULT_CONFIG";

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `DOCVAULT_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV})", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("docvault.yaml"), "project")];

    if let Some(p) = paths::user_config_file() {
        paths.push((p, "user"));
    }

    #[cfg(windows)]
    {
        let program_data = std::env::var_os("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
        paths.push((program_data.join("docvault").join("config.yaml"), "system"));
    }

    #[cfg(not(windows))]
    paths.push((PathBuf::from("/etc/docvault/config.yaml"), "system"));

    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `DOCVAULT_CONFIG` env var > first existing file from
/// search paths. Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// Parse config text, expand `~` in path settings and validate.
pub fn parse_config(text: &str) -> Result<DocvaultConfig> {
    let mut config: DocvaultConfig =
        serde_yaml::from_str(text).map_err(|e| DocvaultError::Config(e.to_string()))?;
    config.repository.url = expand_tilde(&config.repository.url);
    for path in [
        &mut config.store.path,
        &mut config.backup.temp_dir,
        &mut config.restore.history_file,
    ]
    .into_iter()
    .flatten()
    {
        *path = expand_tilde(path);
    }
    config.validate()?;
    Ok(config)
}

/// Load, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<DocvaultConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DocvaultError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    parse_config(&text)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# docvault configuration file

repository:
  url: /path/to/backups/my-workspace

workspace: my-workspace

store:
  path: /path/to/workspace/store

# --- Common optional settings (uncomment as needed) ---

# backup:
#   archive_size_mib: 250
#   blob_limit_mib: 5
#   skip_content_types: ["video/", "image/", "audio/"]
#   keep_snapshots: 84
#   timeout: "30m"
#
# restore:
#   parallel: 1
#   blob_concurrency: 10
#   history_file: ~/.local/state/docvault/restore-history.json
#
# compression:
#   level: 9
"#
}
