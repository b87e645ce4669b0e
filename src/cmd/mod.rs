//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `project` | `Init`, `Anchor`                          |
//! | `run`     | `Advance`, `Drive`                        |
//! | `phase`   | `Status`, `Counters`, `Usage`             |
//! | `lock`    | `Lock`                                    |
//! | `config`  | `Config`                                  |

pub mod config;
pub mod lock;
pub mod phase;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use lock::cmd_lock;
pub use phase::{cmd_counters, cmd_status, cmd_usage};
pub use project::{cmd_anchor, cmd_anchor_validate, cmd_init};
pub use run::{cmd_advance, cmd_drive};
