//! JPEG XL master files exposed as BMP, PNG, and JPEG views.

use std::io::Write;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use jxl_oxide::{JpegReconstructionStatus, JxlImage};

use facet_core::{fd, Driver, DriverError};

const MASTER_EXT: &str = "jxl";

/// Listing order for derived views.
const PHANTOM_EXTS: [&str; 3] = ["bmp", "png", "jpg"];

const JPEG_QUALITY: u8 = 90;

/// Converts `.jxl` masters into `.bmp`, `.png`, and `.jpg` phantoms.
///
/// BMP and PNG keep the alpha channel; JPEG cannot carry one and gets
/// an RGB rendition. JPEG output is lossy re-encoding of the decoded
/// pixels unless the master embeds a reconstructible JPEG bitstream.
pub struct JxlImageDriver;

impl Driver for JxlImageDriver {
    fn resolve_real_path(&self, path: &Path) -> Option<PathBuf> {
        let ext = path.extension()?.to_str()?;
        if !PHANTOM_EXTS.contains(&ext) {
            return None;
        }
        let master = path.with_extension(MASTER_EXT);
        master.exists().then_some(master)
    }

    fn list_phantom_names(&self, path: &Path) -> Option<Vec<PathBuf>> {
        (path.extension()?.to_str()? == MASTER_EXT)
            .then(|| PHANTOM_EXTS.iter().map(|e| path.with_extension(e)).collect())
    }

    fn materialize(&self, master: &Path, phantom_ext: &str) -> Result<OwnedFd, DriverError> {
        match phantom_ext {
            "jpg" => {
                if let Some(out) = reconstruct_jpeg(master)? {
                    return Ok(out);
                }
                encode(master, "jpg")
            }
            "png" | "bmp" => encode(master, phantom_ext),
            other => Err(DriverError::UnsupportedFormat(other.to_owned())),
        }
    }
}

/// Extracts the original JPEG bitstream from a losslessly transcoded
/// master, when the codestream carries one.
///
/// `Ok(None)` means the master has no usable reconstruction data and
/// the caller should re-encode instead. Reconstruction can also fail
/// after the status check says it is available; that falls back too.
fn reconstruct_jpeg(master: &Path) -> Result<Option<OwnedFd>, DriverError> {
    let image = JxlImage::builder()
        .open(master)
        .map_err(|e| DriverError::Decode(e.to_string()))?;
    if !should_reconstruct(image.jpeg_reconstruction_status()) {
        return Ok(None);
    }

    let (out, file) = crate::staging("jxl-jpeg")?;
    let mut writer = std::io::BufWriter::new(file);
    if let Err(err) = image.reconstruct_jpeg(&mut writer) {
        tracing::debug!(master = %master.display(), %err, "jpeg reconstruction failed, re-encoding");
        return Ok(None);
    }
    writer.flush()?;
    drop(writer);
    fd::rewind(&out)?;
    Ok(Some(out))
}

/// Only `Available` is worth attempting. `NeedMoreData` cannot resolve
/// here since the whole file has already been read.
fn should_reconstruct(status: JpegReconstructionStatus) -> bool {
    matches!(status, JpegReconstructionStatus::Available)
}

fn encode(master: &Path, phantom_ext: &str) -> Result<OwnedFd, DriverError> {
    let (width, height, channels, samples) = decode(master)?;
    let (out, file) = crate::staging("jxl-view")?;
    let mut writer = std::io::BufWriter::new(file);

    match phantom_ext {
        "jpg" => {
            let rgb = pack(&samples, channels, 3);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
                .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
        }
        "png" => {
            let rgba = pack(&samples, channels, 4);
            PngEncoder::new(&mut writer).write_image(&rgba, width, height, ExtendedColorType::Rgba8)
        }
        "bmp" => {
            let rgba = pack(&samples, channels, 4);
            BmpEncoder::new(&mut writer).write_image(&rgba, width, height, ExtendedColorType::Rgba8)
        }
        other => return Err(DriverError::UnsupportedFormat(other.to_owned())),
    }
    .map_err(|e| DriverError::Encode(e.to_string()))?;

    writer.flush()?;
    drop(writer);
    fd::rewind(&out)?;
    Ok(out)
}

/// Decodes the first frame to interleaved f32 samples in [0, 1].
fn decode(master: &Path) -> Result<(u32, u32, usize, Vec<f32>), DriverError> {
    let image = JxlImage::builder()
        .open(master)
        .map_err(|e| DriverError::Decode(e.to_string()))?;
    let render = image
        .render_frame(0)
        .map_err(|e| DriverError::Decode(e.to_string()))?;
    let fb = render.image_all_channels();
    Ok((
        fb.width() as u32,
        fb.height() as u32,
        fb.channels(),
        fb.buf().to_vec(),
    ))
}

/// Repacks decoded samples into `want` (3 or 4) interleaved u8
/// channels, expanding grayscale and synthesizing opaque alpha as
/// needed.
fn pack(samples: &[f32], have: usize, want: usize) -> Vec<u8> {
    let pixels = samples.len() / have;
    let mut out = Vec::with_capacity(pixels * want);
    for px in samples.chunks_exact(have) {
        let (r, g, b, a) = match have {
            1 => (px[0], px[0], px[0], 1.0),
            2 => (px[0], px[0], px[0], px[1]),
            3 => (px[0], px[1], px[2], 1.0),
            _ => (px[0], px[1], px[2], px[3]),
        };
        out.push(quantize(r));
        out.push(quantize(g));
        out.push(quantize(b));
        if want == 4 {
            out.push(quantize(a));
        }
    }
    out
}

fn quantize(v: f32) -> u8 {
    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_views_back_to_master() {
        let tmp = tempfile::tempdir().unwrap();
        let master = tmp.path().join("photo.jxl");
        std::fs::write(&master, b"").unwrap();

        let driver = JxlImageDriver;
        for ext in ["bmp", "png", "jpg"] {
            assert_eq!(
                driver.resolve_real_path(&tmp.path().join(format!("photo.{ext}"))),
                Some(master.clone())
            );
        }
        assert!(driver.resolve_real_path(&tmp.path().join("photo.gif")).is_none());
        assert!(driver.resolve_real_path(&tmp.path().join("other.png")).is_none());
    }

    #[test]
    fn lists_views_in_fixed_order() {
        let driver = JxlImageDriver;
        let names = driver
            .list_phantom_names(Path::new("/pics/photo.jxl"))
            .unwrap();
        assert_eq!(
            names,
            vec![
                PathBuf::from("/pics/photo.bmp"),
                PathBuf::from("/pics/photo.png"),
                PathBuf::from("/pics/photo.jpg"),
            ]
        );
        assert!(driver.list_phantom_names(Path::new("/pics/photo.txt")).is_none());
    }

    #[test]
    fn rejects_unknown_output_format() {
        let err = JxlImageDriver
            .materialize(Path::new("/nope.jxl"), "gif")
            .unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedFormat(_)));
    }

    #[test]
    fn reconstruction_runs_only_with_available_data() {
        assert!(should_reconstruct(JpegReconstructionStatus::Available));
        assert!(!should_reconstruct(JpegReconstructionStatus::Unavailable));
        assert!(!should_reconstruct(JpegReconstructionStatus::Invalid));
        assert!(!should_reconstruct(JpegReconstructionStatus::NeedMoreData));
    }

    #[test]
    fn malformed_master_cannot_reconstruct() {
        let tmp = tempfile::tempdir().unwrap();
        let master = tmp.path().join("bad.jxl");
        std::fs::write(&master, b"not a codestream").unwrap();

        let err = reconstruct_jpeg(&master).unwrap_err();
        assert!(matches!(err, DriverError::Decode(_)));
    }

    #[test]
    fn malformed_master_is_a_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let master = tmp.path().join("bad.jxl");
        std::fs::write(&master, b"this is not a codestream").unwrap();

        let err = JxlImageDriver.materialize(&master, "png").unwrap_err();
        assert!(matches!(err, DriverError::Decode(_)));
    }

    #[test]
    fn pack_expands_grayscale_and_alpha() {
        // One gray pixel at half intensity.
        assert_eq!(pack(&[0.5], 1, 3), vec![128, 128, 128]);
        assert_eq!(pack(&[0.5], 1, 4), vec![128, 128, 128, 255]);
        // RGB to RGBA adds opaque alpha; RGBA to RGB drops it.
        assert_eq!(pack(&[1.0, 0.0, 0.0], 3, 4), vec![255, 0, 0, 255]);
        assert_eq!(pack(&[1.0, 0.0, 0.0, 0.25], 4, 3), vec![255, 0, 0]);
    }

    #[test]
    fn quantize_clamps() {
        assert_eq!(quantize(-0.5), 0);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(2.0), 255);
    }
}
