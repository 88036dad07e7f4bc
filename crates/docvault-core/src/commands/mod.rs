pub mod backup;
pub mod check;
pub mod compact;
pub mod download;
pub mod find;
pub mod info;
pub mod list;
pub mod pack;
pub mod prune;
pub mod restore;
pub mod util;
