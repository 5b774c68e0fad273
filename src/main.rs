// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! music-downloader CLI entry point.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use music_downloader::config::{default_config_path, Config};
use music_downloader::logging;
use music_downloader::server::Server;

#[derive(Parser)]
#[command(name = "music-downloader")]
#[command(version)]
#[command(about = "Music search and download service.")]
#[command(long_about = "music-downloader - search for tracks and download them in the background\n\n\
    Start the server:    music-downloader\n\
    Custom port:         music-downloader serve --port 9000\n\
    Show config:         music-downloader config show\n\
    Write config file:   music-downloader config init")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ~/.music-downloader/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    ///
    /// Examples:
    ///   music-downloader serve
    ///   music-downloader serve --port 9000 --bind 0.0.0.0
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
        /// Directory for finished downloads
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },

    /// Inspect or create the config file
    ///
    /// Examples:
    ///   music-downloader config show
    ///   music-downloader config init
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    match cli.command {
        None => serve(cli.config.as_deref(), None, None, None),
        Some(Commands::Serve {
            port,
            bind,
            download_dir,
        }) => serve(cli.config.as_deref(), port, bind, download_dir),
        Some(Commands::Config { command }) => match command.unwrap_or(ConfigCommands::Show) {
            ConfigCommands::Show => show_config(cli.config.as_deref()),
            ConfigCommands::Init { force } => init_config(cli.config.as_deref(), force),
        },
    }
}

fn serve(
    config_path: Option<&Path>,
    port: Option<u16>,
    bind: Option<String>,
    download_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if let Some(dir) = download_dir {
        config.download_dir = dir;
    }
    config.validate()?;

    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("Failed to create download directory {}", config.download_dir.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(Server::new(config).start())
}

fn resolve_path(config_path: Option<&Path>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.to_path_buf()),
        None => default_config_path(),
    }
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let path = resolve_path(config_path)?;
    let config = Config::load_from(&path)?;

    let source = if path.exists() { "" } else { " (not found, showing defaults)" };
    println!("# {}{}", path.display(), source);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn init_config(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = resolve_path(config_path)?;
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
