#![doc = "facility-sync: multi-tenant facility-management sync. External collaborators sit behind the traits in `contract`."]

pub mod cli;
pub mod config;
pub mod contract;
pub mod dedup_log;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod load_config;
pub mod log_store;
pub mod remote;
pub mod service;
pub mod session;
pub mod templates;

#[cfg(test)]
pub(crate) mod testing;
