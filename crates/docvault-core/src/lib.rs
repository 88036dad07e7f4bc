pub mod archive;
pub mod blob;
pub mod commands;
pub mod compress;
pub mod config;
pub mod context;
pub mod error;
pub mod limiter;
pub mod model;
pub mod platform;
pub mod repo;
pub mod storage;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
