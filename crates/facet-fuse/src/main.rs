//! facetfs: mount a backing store with format-converted views.

use std::io;
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use facet_core::Overlay;
use facet_fuse::{spawn_mount, MountConfig, OverlayFs};

/// Mount a directory of master files with derived, format-converted
/// views spliced in
#[derive(Parser)]
#[command(name = "facetfs")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Mount with the default backing store (/mnt/media.store)
    facetfs /mnt/media

    # Mount an explicit backing store
    facetfs /mnt/media --store /data/masters
")]
struct Cli {
    /// Directory where the overlay becomes visible
    mountpoint: PathBuf,

    /// Backing store root (default: <mountpoint>.store)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Allow access from other users
    #[arg(long)]
    allow_other: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let mut config = MountConfig::new(cli.mountpoint);
    config.store = cli.store;
    config.allow_other = cli.allow_other;
    config
        .validate()
        .context("mountpoint/store configuration is invalid")?;

    let store = config.store_path();
    let overlay = Overlay::new(store.clone(), facet_codec::default_registry());
    let fs = OverlayFs::new(overlay);

    let handle = spawn_mount(fs, &config)
        .with_context(|| format!("mounting {}", config.mountpoint.display()))?;
    tracing::info!(
        mountpoint = %config.mountpoint.display(),
        store = %store.display(),
        "facetfs ready"
    );

    // Block until Ctrl-C, then unmount cleanly.
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;
    rx.recv().ok();

    handle.unmount();
    Ok(())
}

/// Set up tracing/logging based on verbosity level.
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
