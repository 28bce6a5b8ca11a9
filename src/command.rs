//! Shell commands.
//!
//! This module defines the [`Command`] enum, which encapsulates one line typed
//! at the `hsm_cli` prompt (or read from a script) and its parsed arguments.
//! It sits between the line parser and the [`Client`](crate::Client): the
//! parser produces a `Command`, and [`execute`](crate::cli::execute) turns it
//! into one or more protocol requests.
//!
//! # Overview
//! - `.exit`: close the session and quit.
//! - `echo <text>`: round-trip bytes through the server.
//! - `key cache <label> <hex> [id]`, `key export|commit|evict|erase <id>`.
//! - `nvm avail|cleanup|list`, `nvm add <id> <label> <text>`,
//!   `nvm meta <id>`, `nvm read <id> <offset> <len>`, `nvm destroy <id>...`.
//! - `custom check <id>`, `custom call <id> <text>`.
//!
//! # Example
//! ```rust
//! use hsmlink::Command;
//!
//! let cmd: Command = "key export 5".try_into().unwrap();
//! assert_eq!(cmd, Command::KeyExport(5));
//! ```
use thiserror::Error;

use crate::protocol::message::NVM_MAX_DESTROY;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Echo(String),
    KeyCache {
        label: String,
        key: Vec<u8>,
        id: Option<u16>,
    },
    KeyExport(u16),
    KeyCommit(u16),
    KeyEvict(u16),
    KeyErase(u16),
    NvmAvailable,
    NvmCleanup,
    NvmList,
    NvmAdd {
        id: u16,
        label: String,
        data: String,
    },
    NvmMetadata(u16),
    NvmRead {
        id: u16,
        offset: u16,
        len: u16,
    },
    NvmDestroy(Vec<u16>),
    CustomCheck(u16),
    CustomCall {
        id: u16,
        data: String,
    },
}

fn invalid(command: &str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn number(command: &str, what: &str, arg: Option<&str>) -> Result<u16, CommandError> {
    let arg = arg.ok_or_else(|| invalid(command, format!("missing {what}")))?;
    let parsed = match arg.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|_| invalid(command, format!("{what} '{arg}' is not a 16-bit number")))
}

fn hex(command: &str, arg: &str) -> Result<Vec<u8>, CommandError> {
    if arg.len() % 2 != 0 {
        return Err(invalid(command, "key hex has an odd number of digits"));
    }
    (0..arg.len())
        .step_by(2)
        .map(|i| {
            arg.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| invalid(command, format!("'{arg}' is not hex")))
        })
        .collect()
}

/// Everything after the first `skip` words, spacing kept.
fn rest(line: &str, skip: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        rest = rest
            .split_once(char::is_whitespace)
            .map_or("", |(_, tail)| tail.trim_start());
    }
    rest
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Err(CommandError::Empty);
        };

        match (first, words.next()) {
            (".exit", None) => Ok(Command::Exit),
            ("echo", _) => Ok(Command::Echo(rest(line, 1).to_string())),
            ("key", Some("cache")) => {
                let label = words
                    .next()
                    .ok_or_else(|| invalid("key cache", "missing label"))?;
                let key = hex(
                    "key cache",
                    words
                        .next()
                        .ok_or_else(|| invalid("key cache", "missing key hex"))?,
                )?;
                let id = match words.next() {
                    Some(id) => Some(number("key cache", "id", Some(id))?),
                    None => None,
                };
                Ok(Command::KeyCache {
                    label: label.to_string(),
                    key,
                    id,
                })
            }
            ("key", Some(action @ ("export" | "commit" | "evict" | "erase"))) => {
                let id = number(&format!("key {action}"), "id", words.next())?;
                Ok(match action {
                    "export" => Command::KeyExport(id),
                    "commit" => Command::KeyCommit(id),
                    "evict" => Command::KeyEvict(id),
                    _ => Command::KeyErase(id),
                })
            }
            ("nvm", Some("avail")) => Ok(Command::NvmAvailable),
            ("nvm", Some("cleanup")) => Ok(Command::NvmCleanup),
            ("nvm", Some("list")) => Ok(Command::NvmList),
            ("nvm", Some("add")) => {
                let id = number("nvm add", "id", words.next())?;
                let label = words
                    .next()
                    .ok_or_else(|| invalid("nvm add", "missing label"))?;
                Ok(Command::NvmAdd {
                    id,
                    label: label.to_string(),
                    data: rest(line, 4).to_string(),
                })
            }
            ("nvm", Some("meta")) => Ok(Command::NvmMetadata(number(
                "nvm meta",
                "id",
                words.next(),
            )?)),
            ("nvm", Some("read")) => Ok(Command::NvmRead {
                id: number("nvm read", "id", words.next())?,
                offset: number("nvm read", "offset", words.next())?,
                len: number("nvm read", "length", words.next())?,
            }),
            ("nvm", Some("destroy")) => {
                let ids = words
                    .map(|id| number("nvm destroy", "id", Some(id)))
                    .collect::<Result<Vec<_>, _>>()?;
                if ids.is_empty() || ids.len() > NVM_MAX_DESTROY {
                    return Err(invalid(
                        "nvm destroy",
                        format!("takes 1 to {NVM_MAX_DESTROY} ids"),
                    ));
                }
                Ok(Command::NvmDestroy(ids))
            }
            ("custom", Some("check")) => Ok(Command::CustomCheck(number(
                "custom check",
                "id",
                words.next(),
            )?)),
            ("custom", Some("call")) => Ok(Command::CustomCall {
                id: number("custom call", "id", words.next())?,
                data: rest(line, 3).to_string(),
            }),
            _ => Err(CommandError::UnrecognizedCommand(line.to_string())),
        }
    }
}
