pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod protocol;
pub mod server;

pub use cli::{CliError, prompt};
pub use client::{Client, ClientError};
pub use command::Command;
pub use config::{ClientConfig, ServerConfig};
