pub mod cli;
pub mod commands;

pub use cli::{help_text, parse, Command};
pub use commands::run;
