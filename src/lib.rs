// Library exports for the agent binary and integration tests

pub mod agent;
pub mod autostart;
pub mod config;
pub mod error;
pub mod events;
pub mod file_log;
pub mod file_monitor;
pub mod file_watcher;
pub mod logging;
pub mod site;
pub mod upload_queue;
