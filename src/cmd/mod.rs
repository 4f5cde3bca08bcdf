//! CLI command implementations.
//!
//! | Module   | Commands handled      |
//! |----------|-----------------------|
//! | `run`    | `Run`                 |
//! | `phase`  | `Status`, `Reset`     |
//! | `config` | `Config`              |

pub mod config;
pub mod phase;
pub mod run;

pub use config::cmd_config;
pub use phase::{cmd_reset, cmd_status};
pub use run::{RunArgs, cmd_run};
