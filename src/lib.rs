pub mod autopilot_config;
pub mod broker;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod gap;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod planning;
pub mod prompts;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod stream;
pub mod tracker;
pub mod ui;
