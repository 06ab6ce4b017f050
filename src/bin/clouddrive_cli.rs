//! CloudDrive CLI - browse and download from a cloud drive
//!
//! Usage:
//!   clouddrive-cli auth <drive>                 Authorize against a drive
//!   clouddrive-cli ls <drive> [path]            List a folder
//!   clouddrive-cli get <drive> <remote> [--out DIR]  Download a file

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use clouddrive_lib::config::{self, DriveConfig};
use clouddrive_lib::providers::oauth2::{bind_callback_listener, wait_for_redirect};
use clouddrive_lib::{
    AuthState, BrowserPresenter, DriveEvent, DriveManager, DriveType, EventChannel, Listing,
    NodeRef, TaskProgress,
};

#[derive(Parser)]
#[command(
    name = "clouddrive-cli",
    about = "CloudDrive CLI - browse and download files from cloud drives",
    version,
    long_about = "Supports Dropbox, Google Drive and local directories.\nDrives: dropbox, gdrive, local"
)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize against a drive
    Auth {
        /// Drive type (dropbox, gdrive, local)
        drive: DriveType,
    },
    /// List a folder
    Ls {
        drive: DriveType,
        /// Folder path (default: /)
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file
    Get {
        drive: DriveType,
        /// Remote file path
        remote: String,
        /// Local directory (default: configured download dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_drive_config(path: Option<&PathBuf>) -> anyhow::Result<DriveConfig> {
    let mut config = match path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    config::apply_env_overrides(&mut config);
    config::validate_config(&config).map_err(|e| anyhow!(e))?;
    Ok(config)
}

/// Select `drive` and run its authorization, answering the browser redirect
/// on the loopback listener
async fn connect(manager: &mut DriveManager, drive: DriveType, redirect_port: u16) -> anyhow::Result<()> {
    manager.set_backend(Some(drive))?;

    let state = if drive.requires_oauth2() {
        let (listener, port) = bind_callback_listener(redirect_port).await?;
        debug!("Waiting for {} redirect on port {}", drive, port);

        let authorize = manager.authorize(&BrowserPresenter);
        tokio::pin!(authorize);
        tokio::select! {
            state = &mut authorize => state?,
            redirect = wait_for_redirect(listener) => {
                let url = redirect?;
                if !manager.handle_redirect(&url) {
                    warn!("Redirect did not match a pending authorization");
                }
                authorize.await?
            }
        }
    } else {
        manager.authorize(&BrowserPresenter).await?
    };

    match state {
        AuthState::Success => Ok(()),
        AuthState::Cancel => bail!("Authorization cancelled"),
        AuthState::Error(e) => bail!("Authorization failed: {}", e),
    }
}

async fn navigate(manager: &mut DriveManager, target: Option<NodeRef>) -> anyhow::Result<Listing> {
    let listing = manager
        .navigate(target)
        .await
        .ok_or_else(|| anyhow!("Another listing is already in progress"))??;
    Ok(listing)
}

/// Walk from the root to the folder at `path`, one listing per segment
async fn open_folder(manager: &mut DriveManager, path: &str) -> anyhow::Result<Listing> {
    let mut listing = navigate(manager, None).await?;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = listing
            .children
            .iter()
            .find(|n| n.is_folder && n.name == segment)
            .cloned()
            .ok_or_else(|| anyhow!("No folder named '{}' in {}", segment, current_path(manager)))?;
        listing = navigate(manager, Some(next)).await?;
    }
    Ok(listing)
}

fn current_path(manager: &DriveManager) -> String {
    manager
        .current()
        .map(|c| c.display_path())
        .unwrap_or_else(|| "/".to_string())
}

fn print_listing(manager: &DriveManager, listing: &Listing) {
    println!("{}", current_path(manager));
    for node in &listing.children {
        if node.is_folder {
            println!("{:>12}  {:<25}  {}/", "", "", node.name);
            continue;
        }
        let size = node.size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        let modified = node.modified.as_deref().unwrap_or("");
        println!("{:>12}  {:<25}  {}", size, modified, node.name);
    }
}

async fn download(manager: &mut DriveManager, remote: &str, local_dir: PathBuf) -> anyhow::Result<()> {
    let (parent, name) = match remote.trim_end_matches('/').rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", remote),
    };
    let listing = open_folder(manager, parent).await?;
    let file = listing
        .children
        .iter()
        .find(|n| n.name == name)
        .cloned()
        .ok_or_else(|| anyhow!("No file named '{}' in {}", name, current_path(manager)))?;

    let mut events = manager.subscribe(EventChannel::Task);
    let id = manager.start_download(&file, &local_dir)?;

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template("{msg} [{bar:40}] {pos}%")?.progress_chars("=> "));
    bar.set_message(file.name.clone());

    loop {
        tokio::select! {
            more = manager.process_next() => {
                if !more {
                    bail!("Download of {} stopped reporting", file.name);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                manager.cancel_download(id);
            }
        }

        while let Ok(event) = events.try_recv() {
            match event {
                DriveEvent::TaskProgress { progress, .. } => match progress {
                    TaskProgress::Fraction(f) => bar.set_position((f * 100.0) as u64),
                    TaskProgress::Indeterminate => {
                        bar.set_style(ProgressStyle::default_spinner());
                        bar.enable_steady_tick(Duration::from_millis(120));
                    }
                },
                DriveEvent::TaskComplete(task) if task.id == id => {
                    bar.finish_with_message(format!("{} -> {}", file.name, task.local_path.display()));
                    return Ok(());
                }
                DriveEvent::TaskCancelled(task) if task.id == id => {
                    bar.abandon_with_message("cancelled");
                    bail!("Download cancelled");
                }
                DriveEvent::TaskError { task, error } if task.id == id => {
                    bar.abandon_with_message("failed");
                    return Err(error.into());
                }
                _ => {}
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_drive_config(cli.config.as_ref())?;
    let redirect_port = config.oauth_redirect_port;
    let download_dir = config.download_dir.clone();
    let mut manager = DriveManager::new(config);

    let result = match cli.command {
        Commands::Auth { drive } => {
            connect(&mut manager, drive, redirect_port).await?;
            println!("Authorized with {}", drive);
            Ok(())
        }
        Commands::Ls { drive, path } => {
            connect(&mut manager, drive, redirect_port).await?;
            let listing = open_folder(&mut manager, &path).await?;
            print_listing(&manager, &listing);
            Ok(())
        }
        Commands::Get { drive, remote, out } => {
            connect(&mut manager, drive, redirect_port).await?;
            download(&mut manager, &remote, out.unwrap_or(download_dir)).await
        }
    };

    manager.shutdown();
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
