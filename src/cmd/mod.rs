//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `run`    | `Run`, `Trigger`   |
//! | `status` | `Status`           |
//! | `config` | `Config`           |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::{cmd_run, cmd_trigger};
pub use status::cmd_status;
