//! BlueChat CLI library
//!
//! Command-line coordinator for the BlueChat engine: argument parsing,
//! configuration loading, and the interactive chat loop.

pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;

pub use cli::{Backend, Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, CliConfig};
pub use coordinator::{ChatCoordinator, ChatState};
pub use error::{CliError, Result};
