//! Command line interface of the `mercure` binary

mod commands;

pub use commands::{Cli, Commands, ServeArgs, TokenArgs};
