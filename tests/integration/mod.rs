//! Integration tests for the replicated mesh object graph

mod access_control;
mod config_integration;
mod home_migration;
mod library_scenario;
mod lock_protocol;
mod maintenance;
mod ordering;
mod reclaim;
mod replication;
mod storage_backends;
mod test_utils;

pub use test_utils::with_xdg_env;
