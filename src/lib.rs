//! print-audit: command-line front end for the `print-audit-core` engine.
//!
//! The binary parses [`cli::Cli`], loads settings through [`load_config`],
//! installs [`logging`] and dispatches to the core pipeline.

pub mod cli;
pub mod load_config;
pub mod logging;

pub use cli::{run, Cli, Commands};
