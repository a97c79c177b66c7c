pub mod cipher;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod error;
pub mod fs_utils;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod swap;
pub mod tags;
pub mod ui;

#[cfg(test)]
pub mod test_utils;
