//! CLI utilities for hsmlink.
//!
//! The utilities present in this module drive a [`Client`] from lines of
//! text, either typed at a prompt or read from a script file.
use std::{
    fmt::Write as _,
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::Path,
};

use thiserror::Error;

use crate::{
    Client, ClientError, Command,
    client::custom::CallbackStatus,
    command::CommandError,
    protocol::Transport,
};

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {source}")]
    Script { line: usize, source: Box<CliError> },
}

/// Prompt user for a command. End of input reads as `.exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CliError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    Ok(Command::try_from(s.as_str())?)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Runs one command, writing its result to `out`.
pub fn execute<T, W>(client: &mut Client<T>, cmd: &Command, out: &mut W) -> Result<(), CliError>
where
    T: Transport,
    W: Write,
{
    match cmd {
        Command::Exit => {
            client.close()?;
            writeln!(out, "session closed")?;
        }
        Command::Echo(text) => {
            let echoed = client.echo(text.as_bytes())?;
            writeln!(out, "{}", String::from_utf8_lossy(&echoed))?;
        }
        Command::KeyCache { label, key, id } => {
            let id = client.key_cache(0, label.as_bytes(), key, *id)?;
            writeln!(out, "cached key {id}")?;
        }
        Command::KeyExport(id) => {
            let (label, key) = client.key_export(*id)?;
            writeln!(out, "{label}: {}", hex(&key))?;
        }
        Command::KeyCommit(id) => {
            client.key_commit(*id)?;
            writeln!(out, "committed key {id}")?;
        }
        Command::KeyEvict(id) => {
            client.key_evict(*id)?;
            writeln!(out, "evicted key {id}")?;
        }
        Command::KeyErase(id) => {
            client.key_erase(*id)?;
            writeln!(out, "erased key {id}")?;
        }
        Command::NvmAvailable => {
            let available = client.nvm_available()?;
            writeln!(
                out,
                "{} bytes and {} objects free, {} bytes and {} objects reclaimable",
                available.avail_size,
                available.avail_objects,
                available.reclaim_size,
                available.reclaim_objects
            )?;
        }
        Command::NvmCleanup => {
            client.nvm_cleanup()?;
            writeln!(out, "storage compacted")?;
        }
        Command::NvmList => {
            let ids = client.nvm_ids(0, 0).collect::<Result<Vec<_>, _>>()?;
            for id in ids {
                let metadata = client.nvm_metadata(id)?;
                writeln!(
                    out,
                    "{id}: '{}' {} bytes, access {:#06x}, flags {:#06x}",
                    metadata.label, metadata.len, metadata.access, metadata.flags
                )?;
            }
        }
        Command::NvmAdd { id, label, data } => {
            client.nvm_add_object(*id, 0, 0, label.as_bytes(), data.as_bytes())?;
            writeln!(out, "stored object {id}")?;
        }
        Command::NvmMetadata(id) => {
            let metadata = client.nvm_metadata(*id)?;
            writeln!(out, "{metadata:?}")?;
        }
        Command::NvmRead { id, offset, len } => {
            let data = client.nvm_read(*id, *offset, *len)?;
            writeln!(out, "{}", String::from_utf8_lossy(&data))?;
        }
        Command::NvmDestroy(ids) => {
            client.nvm_destroy(ids)?;
            writeln!(out, "destroyed {} objects", ids.len())?;
        }
        Command::CustomCheck(id) => match client.custom_check_registered(*id)? {
            CallbackStatus::Registered => writeln!(out, "callback {id} registered")?,
            CallbackStatus::NoHandler => writeln!(out, "callback {id} has no handler")?,
        },
        Command::CustomCall { id, data } => {
            let reply = client.custom_call(*id, data.as_bytes())?;
            writeln!(
                out,
                "callback {id} returned {}: {}",
                reply.err,
                String::from_utf8_lossy(&reply.data)
            )?;
        }
    }
    Ok(())
}

/// Executes every line of `reader`, skipping blanks and `#` comments, and
/// stopping at `.exit` or the first failure. Returns the commands run.
pub fn run_script<T, R, W>(client: &mut Client<T>, reader: R, out: &mut W) -> Result<usize, CliError>
where
    T: Transport,
    R: BufRead,
    W: Write,
{
    let mut executed = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let at_line = |e: CliError| CliError::Script {
            line: index + 1,
            source: Box::new(e),
        };
        let cmd = Command::try_from(trimmed).map_err(|e| at_line(e.into()))?;
        execute(client, &cmd, out).map_err(at_line)?;
        executed += 1;

        if cmd == Command::Exit {
            break;
        }
    }
    Ok(executed)
}

pub fn run_script_file<T, W>(
    client: &mut Client<T>,
    path: &Path,
    out: &mut W,
) -> Result<usize, CliError>
where
    T: Transport,
    W: Write,
{
    let file = File::open(path)?;
    run_script(client, BufReader::new(file), out)
}
