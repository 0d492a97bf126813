//! RIST sender tool
//!
//! Reads an MPEG-TS (or arbitrary byte) stream from stdin, a file, or a UDP
//! socket and transmits it to one or more RIST receivers.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use rist::{DataBlock, PeerConfig, Profile, Sender};
use rist_cli::config::Config;
use rist_cli::stats;
use rist_io::RistSocket;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rist-sender")]
#[command(about = "RIST multi-peer stream sender", long_about = None)]
struct Args {
    /// Input: file path, '-' for stdin, or 'udp://host:port'
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Receiver addresses (host:port); repeatable
    #[arg(short, long)]
    peer: Vec<String>,

    /// Profile: simple, main, or advanced
    #[arg(long, default_value = "main")]
    profile: String,

    /// Pre-shared passphrase (enables AES-CTR)
    #[arg(long)]
    secret: Option<String>,

    /// AES key size (128 or 256)
    #[arg(long, default_value = "128")]
    key_size: u32,

    /// LZ4 compression level (0 disables)
    #[arg(long, default_value = "0")]
    compression: u8,

    /// Flow id (0 lets the library assign one)
    #[arg(long, default_value = "0")]
    flow_id: u32,

    /// TOML config file; peers on the command line are added on top
    #[arg(short, long)]
    config: Option<String>,

    /// Statistics interval in seconds
    #[arg(long, default_value = "1")]
    stats: u64,
}

enum InputSource {
    Stdin,
    File(String),
    Udp(SocketAddr),
}

fn parse_input(input: &str) -> anyhow::Result<InputSource> {
    if input == "-" {
        Ok(InputSource::Stdin)
    } else if let Some(addr) = input.strip_prefix("udp://") {
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };
        Ok(InputSource::Udp(addr.parse()?))
    } else {
        Ok(InputSource::File(input.to_string()))
    }
}

fn create_reader(source: InputSource) -> anyhow::Result<Box<dyn Read + Send>> {
    match source {
        InputSource::Stdin => Ok(Box::new(io::stdin())),
        InputSource::File(path) => {
            let file = File::open(&path).with_context(|| format!("opening {}", path))?;
            Ok(Box::new(BufReader::new(file)))
        }
        InputSource::Udp(addr) => Ok(Box::new(UdpReader::new(RistSocket::bind(addr)?))),
    }
}

struct UdpReader {
    socket: RistSocket,
    buffer: Vec<u8>,
}

impl UdpReader {
    fn new(socket: RistSocket) -> Self {
        UdpReader {
            socket,
            buffer: vec![0u8; 65536],
        }
    }
}

impl Read for UdpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.socket.try_recv_from(&mut self.buffer) {
                Ok(Some((n, _addr))) => {
                    let to_copy = n.min(buf.len());
                    buf[..to_copy].copy_from_slice(&self.buffer[..to_copy]);
                    return Ok(to_copy);
                }
                Ok(None) => std::thread::sleep(Duration::from_micros(200)),
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
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

    let profile = parse_profile(&args.profile)?;
    let sender = Sender::new(profile, args.flow_id)?;

    if let Some(secret) = args
        .secret
        .as_deref()
        .or(config.as_ref().and_then(|c| c.secret.as_deref()))
    {
        sender.encrypt_aes_set(secret, args.key_size)?;
    }
    if args.compression > 0 {
        sender.compression_set(args.compression)?;
    }

    let mut peer_count = 0;
    if let Some(config) = &config {
        for entry in &config.peers {
            sender.peer_add(&entry.to_peer_config())?;
            peer_count += 1;
        }
    }
    for peer in &args.peer {
        let addr: SocketAddr = peer
            .parse()
            .with_context(|| format!("bad peer address '{}'", peer))?;
        sender.peer_add(&PeerConfig::new(addr))?;
        peer_count += 1;
    }
    if peer_count == 0 {
        anyhow::bail!("at least one --peer (or config peer) is required");
    }

    sender.start()?;
    tracing::info!(
        flow_id = format!("{:#010x}", sender.flow_id()),
        peers = peer_count,
        "sender running"
    );

    let mut reader = create_reader(parse_input(&args.input)?)?;
    let mut buffer = vec![0u8; 1316];
    let start = Instant::now();
    let mut last_stats = Instant::now();
    let stats_interval = Duration::from_secs(args.stats.max(1));

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "input read failed");
                break;
            }
        };

        let mut block = DataBlock::new(Bytes::copy_from_slice(&buffer[..n]));
        loop {
            match sender.data_write(block) {
                Ok(_) => break,
                Err(rist::Error::WouldBlock) => {
                    // Pacer backpressure; retry shortly.
                    std::thread::sleep(Duration::from_micros(500));
                    block = DataBlock::new(Bytes::copy_from_slice(&buffer[..n]));
                }
                Err(e) => return Err(e.into()),
            }
        }

        if last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            println!("{}", stats::sender_line(&sender.stats(), start.elapsed()));
        }
    }

    tracing::info!("end of input");
    println!("{}", stats::sender_line(&sender.stats(), start.elapsed()));
    Ok(())
}
