/// Shared helpers for running external tools
pub mod command;
pub mod polling;
pub mod template;
