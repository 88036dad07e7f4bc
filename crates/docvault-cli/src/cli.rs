use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "docvault",
    version,
    about = "Incremental backups for document workspaces",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $DOCVAULT_CONFIG            (environment variable)
  3. ./docvault.yaml             (project)
  4. Platform user config dir + /docvault/config.yaml (e.g. ~/.config or %APPDATA%)
  5. Platform system config path (Unix: /etc/docvault/config.yaml, Windows: %PROGRAMDATA%/docvault/config.yaml)

Snapshot dates are milliseconds since the Unix epoch, as shown by `docvault list`."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides DOCVAULT_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Domain selection shared by several commands.
#[derive(Args, Clone, Debug, Default)]
pub(crate) struct DomainArgs {
    /// Only process this domain (repeatable)
    #[arg(long = "include", value_name = "DOMAIN")]
    pub include: Vec<String>,

    /// Never process this domain (repeatable)
    #[arg(long = "skip", value_name = "DOMAIN")]
    pub skip: Vec<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Record a new incremental snapshot of the workspace
    Backup {
        /// Run even when the workspace reports no new transactions
        #[arg(long)]
        force: bool,

        /// Compare every domain document by document, ignoring stored hashes
        #[arg(long)]
        full_verify: bool,

        #[command(flatten)]
        domains: DomainArgs,
    },

    /// List snapshots in the backup
    List,

    /// Restore the workspace from the backup
    Restore {
        /// Restore the state as of this snapshot date (epoch ms)
        #[arg(long, value_name = "MS")]
        date: Option<i64>,

        /// Keep documents that exist only in the workspace
        #[arg(long)]
        merge: bool,

        /// Compare stored hashes before uploading
        #[arg(long)]
        recheck: bool,

        /// Domains restored concurrently (overrides config)
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,

        /// Record domains already restored in FILE, so a rerun skips them
        #[arg(long, value_name = "FILE")]
        history: Option<String>,

        #[command(flatten)]
        domains: DomainArgs,
    },

    /// Merge all snapshots into one, dropping superseded versions
    Compact {
        /// Compact even when there is a single snapshot
        #[arg(long)]
        force: bool,

        /// Drop blobs larger than this (e.g. 15M, 1G)
        #[arg(long, value_name = "SIZE")]
        blob_limit: Option<String>,

        /// Drop blobs of this content type prefix (repeatable, e.g. video/)
        #[arg(long = "skip-type", value_name = "TYPE")]
        skip_type: Vec<String>,
    },

    /// Verify archives and digests, repairing what is broken
    Check {
        /// Report problems without modifying the backup
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Show backup size statistics
    Size,

    /// Copy the backup to a local directory
    Download {
        /// Destination directory
        dest: String,

        #[command(flatten)]
        domains: DomainArgs,
    },

    /// Show every recorded version of a document
    Find {
        /// Document id
        id: String,
    },

    /// Remove every snapshot taken at or after a date
    Prune {
        /// First snapshot date to remove (epoch ms)
        #[arg(long, value_name = "MS")]
        since: i64,
    },

    /// Remove stale repository locks
    BreakLock,

    /// Generate a starter configuration file
    Config {
        /// Destination path (skips interactive prompt)
        #[arg(short, long)]
        dest: Option<String>,
    },
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::List => "list",
            Self::Restore { .. } => "restore",
            Self::Compact { .. } => "compact",
            Self::Check { .. } => "check",
            Self::Size => "size",
            Self::Download { .. } => "download",
            Self::Find { .. } => "find",
            Self::Prune { .. } => "prune",
            Self::BreakLock => "break-lock",
            Self::Config { .. } => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_domain_flags() {
        let cli = Cli::try_parse_from([
            "docvault", "backup", "--include", "task", "--include", "contact", "--skip", "chat",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup { domains, force, .. } => {
                assert!(!force);
                assert_eq!(domains.include, vec!["task", "contact"]);
                assert_eq!(domains.skip, vec!["chat"]);
            }
            _ => panic!("expected backup"),
        }
    }

    #[test]
    fn prune_requires_a_date() {
        assert!(Cli::try_parse_from(["docvault", "prune"]).is_err());
        let cli = Cli::try_parse_from(["docvault", "prune", "--since", "1700000000000"]).unwrap();
        assert_eq!(cli.command.name(), "prune");
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["docvault", "-vv", "list"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
