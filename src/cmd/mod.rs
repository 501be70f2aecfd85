//! CLI command implementations.
//!
//! | Module   | Commands handled                    |
//! |----------|-------------------------------------|
//! | `gather` | `Navigate`, `Timespan`, `Snapshot`  |
//! | `config` | `Config`                            |

pub mod config;
pub mod gather;

pub use config::cmd_config;
pub use gather::{cmd_navigate, cmd_snapshot, cmd_timespan};
