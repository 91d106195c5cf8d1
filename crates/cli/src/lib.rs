//! Configuration, backend wiring and subcommands of the `tierflow` binary.

pub mod app;
pub mod cli;
pub mod settings;

pub use cli::{Cli, Command};
pub use settings::{ConfigError, PollSettings, QueueNames, Settings};
