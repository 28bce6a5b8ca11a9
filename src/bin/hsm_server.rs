use std::{error::Error, net::SocketAddr};

use clap::Parser;
use hsmlink::{
    ServerConfig,
    config::EraseMissing,
    server::{HsmServer, NetworkServer},
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Transient key cache slots
    #[arg(long, default_value_t = 8)]
    key_slots: usize,
    /// Bytes of object storage
    #[arg(long, default_value_t = 16 * 1024)]
    nvm_capacity: u32,
    /// Maximum number of stored objects
    #[arg(long, default_value_t = 32)]
    nvm_objects: u16,
    /// Connection worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Answer erase of an unknown key with success instead of "not found"
    #[arg(long)]
    lenient_erase: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let erase_missing = if cli.lenient_erase {
        EraseMissing::Ignore
    } else {
        EraseMissing::NotFound
    };
    let config = ServerConfig::default()
        .with_key_slots(cli.key_slots)
        .with_nvm_capacity(cli.nvm_capacity, cli.nvm_objects)
        .with_workers(cli.workers)
        .with_erase_missing(erase_missing);

    ctrlc::set_handler(|| {
        info!("interrupted, shutting down");
        std::process::exit(0);
    })?;

    let server = NetworkServer::bind(cli.address, HsmServer::new(config))?;
    server.listen()?;
    Ok(())
}
