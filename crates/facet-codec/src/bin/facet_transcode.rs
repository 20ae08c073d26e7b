//! One-shot conversion harness for the facetfs drivers.
//!
//! Runs a single master-to-view conversion without mounting anything,
//! which is handy for checking codec behavior in isolation:
//!
//! ```text
//! facet-transcode photo.jxl photo.png
//! facet-transcode track.flac track.wav
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use facet_codec::{FlacAudioDriver, JxlImageDriver};
use facet_core::Driver;

#[derive(Parser)]
#[command(name = "facet-transcode", version, about)]
struct Args {
    /// Master file to convert (.jxl or .flac)
    input: PathBuf,

    /// Output file; its extension selects the target format
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let in_ext = extension(&args.input)?;
    let out_ext = extension(&args.output)?;

    let driver: Box<dyn Driver> = match in_ext {
        "jxl" => Box::new(JxlImageDriver),
        "flac" => Box::new(FlacAudioDriver),
        other => bail!("no driver reads .{other} masters"),
    };

    let staged = driver
        .materialize(&args.input, out_ext)
        .with_context(|| format!("converting {} to .{out_ext}", args.input.display()))?;

    let mut src = File::from(staged);
    let mut dst = File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let bytes = std::io::copy(&mut src, &mut dst)?;
    tracing::info!(bytes, output = %args.output.display(), "wrote converted file");
    Ok(())
}

fn extension(path: &Path) -> Result<&str> {
    path.extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no file extension", path.display()))
}
