//! Command line Kademlia node.
//!
//! Runs until Ctrl-C, or sets/gets a single value and exits.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, Level};

use kadnode::Dht;

#[derive(Parser, Debug)]
#[command(name = "kad", version, about = "Kademlia DHT node")]
struct Args {
    /// Port to listen on, 8468 or any free port if omitted
    #[arg(long, short)]
    port: Option<u16>,
    /// Bootstrapping node as `host:port`, can be repeated
    #[arg(long, short)]
    bootstrap: Vec<String>,
    /// Restore the node from this file if it exists, save it there regularly and on exit
    #[arg(long, short)]
    state: Option<PathBuf>,
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value under a key, then exit
    Set { key: String, value: String },
    /// Look up the value stored under a key, then exit
    Get { key: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .with_target(false)
        .init();

    let mut builder = Dht::builder();

    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(path) = &args.state {
        builder = builder.save_state(path, None);
    }

    let dht = match &args.state {
        Some(path) if path.exists() => {
            info!(?path, "Restoring state");
            Dht::load_state(path, builder)?
        }
        _ => builder.build()?,
    };

    if !args.bootstrap.is_empty() {
        let nodes = dht.bootstrap(&args.bootstrap)?;
        info!(nearest = nodes.len(), "Bootstrapped");
    }

    let node = dht.info()?;
    info!(id = %node.id(), local_addr = %node.local_addr(), "Node is running");

    match args.command {
        Some(Command::Set { key, value }) => {
            let stored = dht.set(&key, value)?;
            println!("{}", if stored { "stored" } else { "not stored" });
        }
        Some(Command::Get { key }) => match dht.get(&key)? {
            Some(value) => println!("{value}"),
            None => println!("not found"),
        },
        None => {
            let (sender, receiver) = flume::bounded(1);
            ctrlc::set_handler(move || {
                let _ = sender.try_send(());
            })?;

            info!("Press Ctrl+C to stop");
            let _ = receiver.recv();
        }
    }

    if let Some(path) = &args.state {
        dht.save_state(path)?;
        info!(?path, "Saved state");
    }

    Ok(())
}
