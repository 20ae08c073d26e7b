//! Format-conversion drivers for facetfs.
//!
//! Each driver pairs a master format with the derived views it can
//! produce: JPEG XL masters become `.bmp`/`.png`/`.jpg` images, FLAC
//! masters become `.wav` audio. Converted output is staged in an
//! anonymous memory-backed file and handed back as a descriptor
//! positioned at offset 0, matching the [`facet_core::Driver`]
//! contract.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;

use facet_core::DriverRegistry;

pub mod audio;
pub mod image;

pub use audio::FlacAudioDriver;
pub use image::JxlImageDriver;

/// Registry with the shipped driver set, in listing order.
pub fn default_registry() -> DriverRegistry {
    DriverRegistry::with_drivers(vec![
        Box::new(JxlImageDriver),
        Box::new(FlacAudioDriver),
    ])
}

/// Fresh memfd plus an owned [`File`] view of it for the encoder to
/// write through. The descriptor and the file share one open file
/// description, so the caller rewinds the descriptor after encoding.
pub(crate) fn staging(label: &str) -> io::Result<(OwnedFd, File)> {
    let fd = facet_core::fd::memfd(label)?;
    let file = File::from(fd.try_clone()?);
    Ok((fd, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn shipped_registry_lists_all_views() {
        let registry = default_registry();
        assert_eq!(
            registry.list_phantom_names(Path::new("/m/photo.jxl")),
            Some(vec![
                PathBuf::from("/m/photo.bmp"),
                PathBuf::from("/m/photo.png"),
                PathBuf::from("/m/photo.jpg"),
            ])
        );
        assert_eq!(
            registry.list_phantom_names(Path::new("/m/clip.flac")),
            Some(vec![PathBuf::from("/m/clip.wav")])
        );
        assert!(registry.list_phantom_names(Path::new("/m/notes.txt")).is_none());
    }
}
