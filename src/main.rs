//! Binary entry point: wires the excluded external collaborators (CLI,
//! config file, logging sink) to the core torrent engine, per spec §1/§6.
//!
//! Grounded on `examples/original_source/src/main.cpp`: parse args, apply
//! the log level, handle `--dump-torrent`/`--dump-config`, otherwise
//! build the torrent, register a ctrl-c handler that calls `stop()`, and
//! `start()`/`run()` it. The original's nested-exception printer
//! (`print_exception`) becomes `anyhow::Error::chain()`.
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use zit_rs::bencode;
use zit_rs::cli::Cli;
use zit_rs::config;
use zit_rs::runtime::SystemClock;
use zit_rs::torrent::file::TorrentFile;
use zit_rs::torrent::session::{Torrent, TorrentConfig};

fn init_logging(log_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let directive = log_level.map(spdlog_level_to_tracing_directive);
    let filter = match directive {
        Some(d) => EnvFilter::try_new(d).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_env("ZIT_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Maps the spec's spdlog-style level names onto a `tracing` `EnvFilter`
/// directive. `critical` has no direct `tracing` equivalent, so it maps
/// to `error` (the closest and most restrictive built-in level).
fn spdlog_level_to_tracing_directive(level: &str) -> &'static str {
    match level {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warning" => "warn",
        "error" | "critical" => "error",
        "off" => "off",
        _ => "info",
    }
}

fn print_error_chain(err: &anyhow::Error) {
    tracing::error!("exception: {err}");
    for (level, cause) in err.chain().skip(1).enumerate() {
        tracing::error!("{}exception: {cause}", " ".repeat(level + 1));
    }
}

fn dump_torrent(metadata: &TorrentFile) {
    println!("name: {}", metadata.info.name);
    println!("announce: {}", metadata.announce);
    if !metadata.announce_list.is_empty() {
        println!("announce-list: {:?}", metadata.announce_list);
    }
    println!("info hash: {}", zit_rs::hash::to_hex_upper(&metadata.info_hash));
    println!("piece length: {}", metadata.info.piece_length);
    println!("pieces: {}", metadata.num_pieces());
    println!("total length: {}", metadata.total_length());
    println!("private: {}", metadata.info.private);
    if metadata.info.is_directory {
        println!("files:");
        for file in &metadata.info.files {
            println!("  {} ({} bytes)", file.path.join("/"), file.length);
        }
    }
}

fn dump_config(config: &config::Config, listening_port: u16) {
    println!("initiate_peer_connections={}", config.initiate_peer_connections);
    println!(
        "listening_port={}",
        if listening_port != 0 {
            listening_port
        } else {
            config.listening_port.unwrap_or(0)
        }
    );
    println!("connection_port={}", config.connection_port.unwrap_or(0));
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file_config = config::load()?;
    let listening_port = if cli.listening_port != 0 {
        cli.listening_port
    } else {
        file_config.listening_port.unwrap_or(0)
    };

    if cli.dump_config {
        dump_config(&file_config, listening_port);
        return Ok(());
    }

    let bytes = std::fs::read(&cli.torrent)?;
    let value = bencode::decode(&bytes)?;
    let metadata = TorrentFile::parse(value)?;

    if cli.dump_torrent {
        dump_torrent(&metadata);
        return Ok(());
    }

    let torrent_config = TorrentConfig {
        initiate_peer_connections: file_config.initiate_peer_connections,
        ..TorrentConfig::default()
    };

    let torrent = Torrent::open(
        metadata,
        PathBuf::from("."),
        listening_port,
        torrent_config,
        Arc::new(SystemClock),
    )
    .await?;

    zit_rs::acceptor::register(torrent.clone());

    tokio::spawn(zit_rs::acceptor::listen_registered(std::net::SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        listening_port,
    )));

    torrent.start().await?;

    let run_handle = {
        let torrent = torrent.clone();
        tokio::spawn(async move { torrent.run().await })
    };

    tokio::select! {
        _ = run_handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("ctrl-c pressed, stopping torrent");
            torrent.stop().await;
        }
    }

    Ok(())
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.validate_log_level() {
        eprintln!("{e}");
        return std::process::ExitCode::from(1);
    }
    init_logging(cli.log_level.as_deref());

    let runtime = tokio::runtime::Runtime::new().expect("failed to start the tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::from(0),
        Err(e) => {
            print_error_chain(&e);
            std::process::ExitCode::from(1)
        }
    }
}
