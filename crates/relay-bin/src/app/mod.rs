//! Application wiring and command handlers.

mod commands;
mod state;

pub use commands::{parse_field, report, run, status, submit, tick};
pub use state::RelayState;
