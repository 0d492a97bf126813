//! RIST receiver tool
//!
//! Listens for one or more RIST senders and writes the recovered stream to
//! stdout, a file, or a UDP destination.

use anyhow::Context;
use clap::Parser;
use rist::{PeerConfig, Profile, Receiver};
use rist_cli::config::Config;
use rist_cli::stats;
use rist_io::RistSocket;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rist-receiver")]
#[command(about = "RIST stream receiver", long_about = None)]
struct Args {
    /// Listen addresses (host:port); repeatable
    #[arg(short, long)]
    listen: Vec<String>,

    /// Output: '-' for stdout, a file path, or 'udp://host:port'
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Profile: simple, main, or advanced
    #[arg(long, default_value = "main")]
    profile: String,

    /// Pre-shared passphrase (enables AES-CTR)
    #[arg(long)]
    secret: Option<String>,

    /// AES key size (128 or 256)
    #[arg(long, default_value = "128")]
    key_size: u32,

    /// Use bitmask NACKs instead of ranges
    #[arg(long)]
    bitmask_nacks: bool,

    /// TOML config file; listens on the command line are added on top
    #[arg(short, long)]
    config: Option<String>,

    /// Statistics interval in seconds
    #[arg(long, default_value = "1")]
    stats: u64,
}

enum Output {
    Stdout(io::Stdout),
    File(File),
    Udp(RistSocket, SocketAddr),
}

impl Output {
    fn open(spec: &str) -> anyhow::Result<Self> {
        if spec == "-" {
            Ok(Output::Stdout(io::stdout()))
        } else if let Some(addr) = spec.strip_prefix("udp://") {
            let addr: SocketAddr = addr.parse()?;
            let socket = RistSocket::bind_for(addr)?;
            Ok(Output::Udp(socket, addr))
        } else {
            Ok(Output::File(
                File::create(spec).with_context(|| format!("creating {}", spec))?,
            ))
        }
    }

    fn write_block(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        match self {
            Output::Stdout(out) => out.write_all(payload)?,
            Output::File(file) => file.write_all(payload)?,
            Output::Udp(socket, addr) => {
                let _ = socket.send_to(payload, *addr);
            }
        }
        Ok(())
    }
}

fn parse_profile(name: &str) -> anyhow::Result<Profile> {
    match name {
        "simple" => Ok(Profile::Simple),
        "main" => Ok(Profile::Main),
        "advanced" => Ok(Profile::Advanced),
        other => anyhow::bail!("unknown profile '{}'", other),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Some(Config::from_file(path).with_context(|| format!("loading {}", path))?),
        None => None,
    };

    let receiver = Receiver::new(parse_profile(&args.profile)?)?;

    if let Some(secret) = args
        .secret
        .as_deref()
        .or(config.as_ref().and_then(|c| c.secret.as_deref()))
    {
        receiver.encrypt_aes_set(secret, args.key_size)?;
    }
    if args.bitmask_nacks {
        receiver.nack_type_set(rist::NackType::Bitmask)?;
    }

    let mut listen_count = 0;
    if let Some(config) = &config {
        for entry in &config.peers {
            receiver.peer_add(&entry.to_peer_config())?;
            listen_count += 1;
        }
    }
    for listen in &args.listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("bad listen address '{}'", listen))?;
        receiver.peer_add(&PeerConfig::new(addr))?;
        listen_count += 1;
    }
    if listen_count == 0 {
        anyhow::bail!("at least one --listen (or config peer) is required");
    }

    receiver.start()?;
    tracing::info!(listeners = listen_count, "receiver running");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        watch_stdin_eof(move || running.store(false, Ordering::SeqCst));
    }

    let mut output = Output::open(&args.output)?;
    let mut last_stats = Instant::now();
    let stats_interval = Duration::from_secs(args.stats.max(1));

    while running.load(Ordering::SeqCst) {
        match receiver.data_read(Duration::from_millis(100)) {
            Ok(block) => output.write_block(&block.payload)?,
            Err(rist::Error::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }

        if last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            stats::display_receiver_stats(&receiver.stats());
        }
    }

    stats::display_receiver_stats(&receiver.stats());
    Ok(())
}

/// Orderly shutdown on stdin EOF; SIGINT keeps its default disposition
fn watch_stdin_eof(handler: impl Fn() + Send + 'static) {
    std::thread::spawn(move || {
        let mut line = String::new();
        while io::stdin().read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
            line.clear();
        }
        handler();
    });
}
