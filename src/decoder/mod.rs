//! Format decoders and the extension-driven factory that selects them.
//!
//! Each decoder owns its [`Stream`] for the duration of one file and is
//! drained by repeatedly calling [`Decoder::step`] until it returns
//! `Ok(0)` (clean end of stream) or an error. The engine has no
//! format-specific branches outside the factory.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::DecodeError;
use crate::stream::OpenMode;

pub mod flac;
pub mod mp3;
pub mod vorbis;
pub mod wavpack;

/// One end-to-end validator for a single open file.
pub trait Decoder {
    /// Advances by one unit (a frame, a block, or a sample chunk,
    /// depending on the format). `Ok(0)` means the stream was drained
    /// cleanly and the file passed.
    fn step(&mut self) -> Result<u64, DecodeError>;

    /// Total units the stream declares, used as the progress denominator.
    /// Zero when the stream does not declare a total.
    fn total_units(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Flac,
    Mp3,
    WavPack,
    Vorbis,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Flac => "FLAC",
            Format::Mp3 => "MP3",
            Format::WavPack => "WavPack",
            Format::Vorbis => "Ogg-Vorbis",
        }
    }
}

/// Maps filenames to decoder variants and constructs ready-to-drain
/// decoders. The extension table is fixed at construction.
pub struct DecoderFactory {
    extensions: HashMap<&'static str, Format>,
    mode: OpenMode,
}

impl DecoderFactory {
    pub fn new(mode: OpenMode) -> Self {
        let mut extensions = HashMap::new();
        for ext in ["flac", "fla"] {
            extensions.insert(ext, Format::Flac);
        }
        for ext in ["mp3", "mp2", "m2a"] {
            extensions.insert(ext, Format::Mp3);
        }
        extensions.insert("wv", Format::WavPack);
        extensions.insert("ogg", Format::Vorbis);
        DecoderFactory { extensions, mode }
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Classifies by the last extension segment of the filename,
    /// case-insensitive. `None` means unsupported.
    pub fn classify(&self, path: &Path) -> Option<Format> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.extensions.get(ext.as_str()).copied()
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        self.classify(path).is_some()
    }

    /// Constructs the stream and runs the decoder's open sequence (header
    /// parse, metadata pre-read). Returns a ready-to-drain decoder.
    pub fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, DecodeError> {
        let Some(format) = self.classify(path) else {
            return Err(DecodeError::Unsupported);
        };
        debug!(path = %path.display(), format = format.name(), "opening decoder");
        match format {
            Format::Flac => Ok(Box::new(flac::FlacDecoder::open(path, self.mode)?)),
            Format::Mp3 => Ok(Box::new(mp3::Mp3Decoder::open(path, self.mode)?)),
            Format::WavPack => Ok(Box::new(wavpack::WavPackDecoder::open(path, self.mode)?)),
            Format::Vorbis => Ok(Box::new(vorbis::VorbisDecoder::open(path, self.mode)?)),
        }
    }
}
