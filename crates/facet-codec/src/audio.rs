//! FLAC master files exposed as WAV views.

use std::io::BufWriter;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use facet_core::{fd, Driver, DriverError};

const MASTER_EXT: &str = "flac";
const PHANTOM_EXT: &str = "wav";

/// Converts `.flac` masters into `.wav` phantoms.
///
/// The WAV carries integer PCM with the stream's own channel count,
/// sample rate, and bit depth; samples pass through untouched.
pub struct FlacAudioDriver;

impl Driver for FlacAudioDriver {
    fn resolve_real_path(&self, path: &Path) -> Option<PathBuf> {
        if path.extension()?.to_str()? != PHANTOM_EXT {
            return None;
        }
        let master = path.with_extension(MASTER_EXT);
        master.exists().then_some(master)
    }

    fn list_phantom_names(&self, path: &Path) -> Option<Vec<PathBuf>> {
        (path.extension()?.to_str()? == MASTER_EXT)
            .then(|| vec![path.with_extension(PHANTOM_EXT)])
    }

    fn materialize(&self, master: &Path, phantom_ext: &str) -> Result<OwnedFd, DriverError> {
        if phantom_ext != PHANTOM_EXT {
            return Err(DriverError::UnsupportedFormat(phantom_ext.to_owned()));
        }

        let mut reader =
            claxon::FlacReader::open(master).map_err(|e| DriverError::Decode(e.to_string()))?;
        let info = reader.streaminfo();
        let spec = hound::WavSpec {
            channels: info.channels as u16,
            sample_rate: info.sample_rate,
            bits_per_sample: info.bits_per_sample as u16,
            sample_format: hound::SampleFormat::Int,
        };

        let (out, file) = crate::staging("flac-view")?;
        let mut writer = hound::WavWriter::new(BufWriter::new(file), spec)
            .map_err(|e| DriverError::Encode(e.to_string()))?;

        // claxon yields samples already interleaved across channels,
        // which is exactly WAV's frame layout.
        for sample in reader.samples() {
            let sample = sample.map_err(|e| DriverError::Decode(e.to_string()))?;
            writer
                .write_sample(sample)
                .map_err(|e| DriverError::Encode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| DriverError::Encode(e.to_string()))?;

        fd::rewind(&out)?;
        Ok(out)
    }
}
