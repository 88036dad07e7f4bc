pub(crate) mod backup;
pub(crate) mod break_lock;
pub(crate) mod check;
pub(crate) mod compact;
pub(crate) mod download;
pub(crate) mod find;
pub(crate) mod list;
pub(crate) mod prune;
pub(crate) mod restore;
pub(crate) mod size;

use docvault_core::commands::util::DomainFilter;

use crate::cli::DomainArgs;

impl From<&DomainArgs> for DomainFilter {
    fn from(args: &DomainArgs) -> Self {
        DomainFilter {
            include: (!args.include.is_empty()).then(|| args.include.iter().cloned().collect()),
            skip: args.skip.iter().cloned().collect(),
        }
    }
}

pub(crate) type CmdResult<T = ()> = Result<T, Box<dyn std::error::Error>>;
