use anyhow::{Context, Result};
use burrow::{Config, DnsSession};
use clap::Parser;
use std::io::{stdin, Read};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "burrow", about = "DNS tunnel client for the burrow C2 transport")]
struct Args {
    /// Path to a JSON config (falls back to env/embedded config)
    #[arg(short, long)]
    config: Option<String>,

    /// Parent zone override
    #[arg(short, long)]
    parent: Option<String>,

    /// Message to send (omit to read from stdin)
    #[arg(short, long)]
    message: Option<String>,

    /// How many times to poll for a reply before giving up
    #[arg(long, default_value_t = 10)]
    polls: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut cfg = match args.config.as_deref() {
        Some(path) => Config::from_file(path).map_err(|e| anyhow::anyhow!(e))?,
        None => Config::load(),
    };
    if let Some(parent) = args.parent {
        cfg.parent = parent;
    }

    let envelope = match args.message {
        Some(message) => message.into_bytes(),
        None => {
            let mut buffer = Vec::new();
            stdin()
                .read_to_end(&mut buffer)
                .context("failed to read stdin")?;
            buffer
        }
    };
    if envelope.is_empty() {
        anyhow::bail!("no data to send");
    }

    println!("[*] Connecting to '{}' ...", cfg.parent);
    let start = Instant::now();
    let session = DnsSession::connect(&cfg).context("session handshake failed")?;
    println!(
        "[+] Session {:#08x} established in {:.1?}",
        session.session_id(),
        start.elapsed()
    );
    for meta in session.resolver_metadata() {
        println!(
            "[*]   {}: avg rtt {:.1?}, base58: {}",
            meta.address,
            meta.average_rtt(),
            meta.enable_base58
        );
    }

    session
        .write_envelope(&envelope)
        .context("failed to send envelope")?;
    println!("[+] Sent {} bytes", envelope.len());

    for _ in 0..args.polls {
        match session.read_envelope().context("poll failed")? {
            Some(reply) => {
                println!("[+] Received {} bytes:", reply.len());
                println!("{}", String::from_utf8_lossy(&reply));
                break;
            }
            None => thread::sleep(Duration::from_secs(1)),
        }
    }

    session.close();
    Ok(())
}
