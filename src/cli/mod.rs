pub mod cli;
pub mod commands;

pub use cli::{CommandArgs, Commands, ServeArgs};
