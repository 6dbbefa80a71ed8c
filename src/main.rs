//! # Leech
//!
//! Command-line front end of the leech BitTorrent client.
//!
//! ## Usage
//!
//! ```bash
//! leech decode 'd3:cow3:moo4:spam4:eggse'
//! leech info sample.torrent
//! leech peers sample.torrent
//! leech handshake sample.torrent 178.62.82.89:51470
//! leech download-piece -o /tmp/piece-0 sample.torrent 0
//! leech download -o sample.txt sample.torrent
//! ```
//!
//! Logs go to stderr; set `RUST_LOG=leech=debug` for protocol traces.

#[macro_use]
extern crate log;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use leech::piece::verify_piece;
use leech::{bencode, cancellation, tracker, Config, Metadata, Peer, PeerConnection};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Seconds allowed to connect to a peer
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Seconds allowed for a single read or write on a peer connection
    #[arg(long, global = true)]
    io_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// Bencoded value
        value: String,
    },
    /// Print torrent metadata
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Print the peers returned by the tracker
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Handshake with a peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as <ip>:<port>
        peer: String,
    },
    /// Download and verify a single piece
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long)]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Zero-based piece index
        index: u32,
    },
    /// Download the whole file
    Download {
        /// Output filename (defaults to name from torrent)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        /// Maximum number of pieces downloaded at once (defaults to one per peer)
        #[arg(short = 'w', long)]
        workers: Option<usize>,
        /// Overwrite the output file without asking
        #[arg(long)]
        force: bool,
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

fn load_torrent(path: &Path) -> Result<Metadata> {
    if !path.exists() {
        return Err(anyhow!("could not find torrent file: {}", path.display()));
    }
    let bytes = fs::read(path)
        .with_context(|| format!("could not read torrent file '{}'", path.display()))?;
    let metadata = Metadata::from_bytes(&bytes)
        .with_context(|| format!("could not parse torrent file '{}'", path.display()))?;
    Ok(metadata)
}

/// Ask before replacing an existing file. Returns false if the user declines.
fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", path.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("could not create output file '{}'", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("could not write data to file '{}'", path.display()))?;
    Ok(())
}

fn decode(value: &str) -> Result<()> {
    let (decoded, rest) = bencode::decode(value.as_bytes())?;
    if !rest.is_empty() {
        warn!("Ignoring {} trailing bytes", rest.len());
    }
    println!("{}", serde_json::to_string(&decoded)?);
    Ok(())
}

fn info(torrent: &Path) -> Result<()> {
    let metadata = load_torrent(torrent)?;
    println!("Tracker URL: {}", metadata.announce);
    println!("Length: {}", metadata.length);
    println!("Info Hash: {}", metadata.info_hash_hex());
    println!("Piece Length: {}", metadata.piece_length);
    println!("Piece Hashes:");
    for hash in &metadata.piece_hashes {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

fn peers(torrent: &Path, config: &Config) -> Result<()> {
    let metadata = load_torrent(torrent)?;
    let response = tracker::announce(&metadata, config)?;
    for peer in response.peers {
        println!("{}", peer);
    }
    Ok(())
}

fn handshake(torrent: &Path, peer: &str, config: &Config) -> Result<()> {
    let metadata = load_torrent(torrent)?;
    let peer: Peer = peer.parse()?;
    let mut conn = PeerConnection::connect(peer, config)?;
    let remote_id = conn.handshake(&metadata)?;
    conn.close();
    println!("Peer ID: {}", hex::encode(remote_id));
    Ok(())
}

fn download_piece(output: &Path, torrent: &Path, index: u32, config: &Config) -> Result<()> {
    let metadata = load_torrent(torrent)?;
    let hash = *metadata.piece_hash(index)?;
    let peers = tracker::announce(&metadata, config)?.peers;

    for peer in peers {
        let attempt = || -> leech::Result<Vec<u8>> {
            let mut conn = PeerConnection::connect(peer, config)?;
            conn.handshake(&metadata)?;
            let data = conn.download_unit(&metadata, index);
            conn.close();
            let data = data?;
            verify_piece(index, &data, &hash)?;
            Ok(data)
        };

        match attempt() {
            Ok(data) => {
                write_output(output, &data)?;
                println!("Piece {} downloaded to {}.", index, output.display());
                return Ok(());
            }
            Err(e) => warn!("Could not download piece {} from peer {}: {}", index, peer, e),
        }
    }

    Err(anyhow!("could not download piece {} from any peer", index))
}

fn download(
    output: Option<PathBuf>,
    workers: Option<usize>,
    force: bool,
    torrent: &Path,
    mut config: Config,
) -> Result<()> {
    let metadata = load_torrent(torrent)?;

    // Determine output filename
    let output = output.unwrap_or_else(|| PathBuf::from(sanitize_filename(&metadata.name)));
    if output.exists() && !force && !confirm_overwrite(&output)? {
        println!("Download cancelled.");
        return Ok(());
    }

    if workers.is_some() {
        config.max_workers = workers;
    }

    let peers = tracker::announce(&metadata, &config)?.peers;

    let (handle, cancel) = cancellation();
    ctrlc::set_handler(move || handle.cancel()).context("could not install Ctrl-C handler")?;

    // Create progress bar
    let pb = ProgressBar::new(metadata.length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")?
            .progress_chars("#>-"),
    );

    let report = leech::download_with_progress(&metadata, &peers, &config, cancel, pb.clone())?;
    pb.finish();

    if !report.is_complete() {
        return Err(anyhow!(
            "download incomplete: {} pieces completed, {} failed, {} not attempted",
            report.completed,
            report.failed,
            report.abandoned
        ));
    }

    write_output(&output, &report.data)?;
    println!("Saved in \"{}\".", output.display());

    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::default();
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.io_timeout {
        config.io_timeout = Duration::from_secs(secs);
    }

    match args.command {
        Command::Decode { value } => decode(&value),
        Command::Info { torrent } => info(&torrent),
        Command::Peers { torrent } => peers(&torrent, &config),
        Command::Handshake { torrent, peer } => handshake(&torrent, &peer, &config),
        Command::DownloadPiece {
            output,
            torrent,
            index,
        } => download_piece(&output, &torrent, index, &config),
        Command::Download {
            output,
            workers,
            force,
            torrent,
        } => download(output, workers, force, &torrent, config),
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
