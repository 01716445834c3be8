mod config;
mod debug;
mod ingest;
mod relay;
mod replay;
mod report;
mod split;
mod store;

use std::io::stderr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Parser)]
#[command(name = "hrdl", version, about = "HRDL downlink demultiplexing toolkit")]
struct Cli {
    /// TOML configuration file; fields set there take precedence over
    /// command-line flags.
    #[arg(short = 'f', long, global = true, value_name = "path")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reassemble HRDL packets from a socket and relay them to a
    /// downstream hadock server through a connection pool.
    Relay {
        /// Ingress address, e.g. udp://:5000 or tcp://:5000.
        local: String,
        /// Downstream address, e.g. tcp://hadock:5100.
        remote: String,
        /// Queue size before dropping HRDL packets.
        #[arg(short = 'q', long, default_value_t = 64)]
        queue: usize,
        /// Ring buffer size in bytes between the socket and the
        /// reassembler.
        #[arg(short = 'b', long, default_value_t = 64 << 20)]
        buffer: usize,
        /// Hadock instance (0, 1, 2, 255) or -1 for verbatim HRDL.
        #[arg(short = 'i', long, default_value_t = -1, allow_hyphen_values = true)]
        instance: i32,
        /// Keep packets whose trailer checksum does not verify.
        #[arg(short = 'k', long)]
        keep: bool,
        /// Outbound bandwidth cap in bytes per second.
        #[arg(short = 'r', long)]
        rate: Option<u64>,
        /// Per-frame prefix bytes to skip (8 for hrdfe streams).
        #[arg(short = 'c', long, default_value_t = 0)]
        skip: usize,
        /// Proxy the raw CADU stream to this address for debugging.
        #[arg(short = 'x', long)]
        proxy: Option<String>,
        /// Number of persistent downstream connections.
        #[arg(short = 'n', long, default_value_t = 8)]
        connections: usize,
    },
    /// Reassemble HRDL packets from a socket and append them to a
    /// rotating HRDP archive.
    Store {
        /// Ingress address, e.g. udp://:5000.
        local: String,
        /// Archive root directory.
        dir: PathBuf,
        #[arg(short = 'q', long, default_value_t = 64)]
        queue: usize,
        #[arg(short = 'b', long, default_value_t = 64 << 20)]
        buffer: usize,
        #[arg(short = 'k', long)]
        keep: bool,
        #[arg(short = 'c', long, default_value_t = 0)]
        skip: usize,
        #[arg(short = 'x', long)]
        proxy: Option<String>,
        /// Payload id stored in every HRDP header.
        #[arg(short = 'p', long, default_value_t = 2)]
        payload: u8,
        /// Rotate after this many seconds.
        #[arg(long, default_value_t = 300, value_name = "seconds")]
        interval: u64,
        /// Rotate after this long without a write (0 disables).
        #[arg(long, default_value_t = 0, value_name = "seconds")]
        idle: u64,
        /// Rotate past this many bytes (0 disables).
        #[arg(long, default_value_t = 0)]
        max_bytes: u64,
        /// Rotate past this many packets (0 disables).
        #[arg(long, default_value_t = 0)]
        max_count: u64,
    },
    /// Decode HRDL packets from files and print one row per packet.
    List {
        files: Vec<PathBuf>,
        /// Input carries the 8-byte hrdfe reception prefix.
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
    /// Count HRDL packets per channel or origin.
    Count {
        files: Vec<PathBuf>,
        #[arg(short = 'e', long)]
        hrdfe: bool,
        /// Group by "channel" or "origin".
        #[arg(short = 'b', long, default_value = "channel")]
        by: String,
    },
    /// Print an index row for every HRDL packet found in the CADU
    /// stream.
    Index {
        files: Vec<PathBuf>,
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
    /// Audit a CADU stream: totals, gaps, CRC errors, fillers, packets.
    Inspect {
        files: Vec<PathBuf>,
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
    /// Replay CADU files to a remote socket at a capped rate.
    Replay {
        /// Destination address, e.g. udp://sim:5000.
        remote: String,
        files: Vec<PathBuf>,
        #[arg(short = 'r', long)]
        rate: Option<u64>,
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
    /// Print one row per CADU.
    Dump {
        files: Vec<PathBuf>,
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
    /// Listen for re-framed HRDL packets from a downstream and print
    /// them.
    Debug {
        /// Listen address, e.g. tcp://:5100.
        local: String,
        #[arg(short = 'q', long, default_value_t = 64)]
        queue: usize,
        #[arg(short = 'i', long, default_value_t = -1, allow_hyphen_values = true)]
        instance: i32,
    },
    /// Listen for raw CADUs over UDP and print per-second statistics.
    Trace {
        /// Listen address, e.g. udp://:5000.
        local: String,
    },
    /// Split the HRDL packets of a CADU stream into one file per
    /// channel.
    Split {
        files: Vec<PathBuf>,
        /// Output directory.
        #[arg(short = 'd', long, default_value = ".")]
        dir: PathBuf,
        #[arg(short = 'e', long)]
        hrdfe: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("HRDL_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Relay {
            local,
            remote,
            queue,
            buffer,
            instance,
            keep,
            rate,
            skip,
            proxy,
            connections,
        } => relay::run(relay::Options {
            local,
            remote,
            queue: cfg.queue.unwrap_or(queue),
            buffer: cfg.buffer.unwrap_or(buffer),
            instance: cfg.instance.unwrap_or(instance),
            keep: cfg.keep.unwrap_or(keep),
            rate: cfg.rate.or(rate),
            skip: cfg.skip.unwrap_or(skip),
            proxy: cfg.proxy.clone().or(proxy),
            connections: cfg.connections.unwrap_or(connections),
        }),
        Commands::Store {
            local,
            dir,
            queue,
            buffer,
            keep,
            skip,
            proxy,
            payload,
            interval,
            idle,
            max_bytes,
            max_count,
        } => store::run(store::Options {
            local,
            dir,
            queue: cfg.queue.unwrap_or(queue),
            buffer: cfg.buffer.unwrap_or(buffer),
            keep: cfg.keep.unwrap_or(keep),
            skip: cfg.skip.unwrap_or(skip),
            proxy: cfg.proxy.clone().or(proxy),
            payload,
            interval,
            idle,
            max_bytes,
            max_count,
        }),
        Commands::List { files, hrdfe } => report::list(&files, hrdfe),
        Commands::Count { files, hrdfe, by } => report::count(&files, hrdfe, &by),
        Commands::Index { files, hrdfe } => report::index(&files, hrdfe),
        Commands::Inspect { files, hrdfe } => report::inspect(&files, hrdfe),
        Commands::Replay {
            remote,
            files,
            rate,
            hrdfe,
        } => replay::run(&remote, &files, cfg.rate.or(rate), hrdfe),
        Commands::Dump { files, hrdfe } => report::dump(&files, hrdfe),
        Commands::Debug {
            local,
            queue,
            instance,
        } => debug::listen(&local, cfg.queue.unwrap_or(queue), cfg.instance.unwrap_or(instance)),
        Commands::Trace { local } => debug::trace(&local),
        Commands::Split { files, dir, hrdfe } => split::run(&files, &dir, hrdfe),
    }
}
