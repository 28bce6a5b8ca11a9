use std::{
    error::Error,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use hsmlink::{
    Client, ClientConfig, Command,
    cli::{execute, prompt, run_script_file},
    config::PollStrategy,
    protocol::TcpTransport,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of a running hsm_server
    address: SocketAddr,
    /// Limit request payloads below the channel's own
    #[arg(long)]
    max_payload: Option<usize>,
    /// Sleep this many microseconds between receive polls instead of yielding
    #[arg(long)]
    poll_us: Option<u64>,
    /// Run commands from a file instead of prompting
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::default();
    if let Some(max_payload) = cli.max_payload {
        config = config.with_max_payload(max_payload);
    }
    if let Some(us) = cli.poll_us {
        config = config.with_poll(PollStrategy::Sleep(Duration::from_micros(us)));
    }

    let mut client = Client::connect(TcpTransport::new(cli.address), config)?;
    let ids = client.open()?;
    println!(
        "connected as client {} to server {:#010x}",
        ids.client_id, ids.server_id
    );

    let mut stdout = io::stdout().lock();
    if let Some(path) = cli.script {
        run_script_file(&mut client, &path, &mut stdout)?;
        client.disconnect()?;
        return Ok(());
    }

    loop {
        let cmd = match prompt(io::stdin().lock(), &mut stdout) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match execute(&mut client, &cmd, &mut stdout) {
            Ok(()) => {}
            Err(hsmlink::CliError::Client(e)) if e.is_fatal() => {
                eprintln!("session lost: {e}");
                break;
            }
            Err(e) => eprintln!("error: {e}"),
        }
        stdout.flush()?;

        if cmd == Command::Exit {
            break;
        }
    }

    client.disconnect()?;
    Ok(())
}
