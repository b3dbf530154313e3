//! Ogg-Vorbis validator.
//!
//! Decodes the stream chunk by chunk through the Vorbis engine. Whether
//! the stream terminates cleanly is decided by the final Ogg page's
//! end-of-stream flag, captured with a bounded tail scan at open; the same
//! scan yields the final granule position, which is the total PCM sample
//! count.

use std::path::Path;

use symphonia::core::codecs::Decoder as AudioDecoder;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_VORBIS};
use symphonia::core::errors::Error as EngineError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::decoder::Decoder;
use crate::error::{DecodeError, Position};
use crate::stream::{OpenMode, Origin, Stream};

/// How far back from EOF to look for the last page header.
const TAIL_SCAN_WINDOW: u64 = 65_536;

/// Flags and granule of the last complete Ogg page in the file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OggTail {
    pub granule: Option<u64>,
    pub end_of_stream: bool,
}

pub(crate) fn scan_tail(stream: &mut Stream) -> OggTail {
    let window = stream.len().min(TAIL_SCAN_WINDOW);
    if window < 27 || stream.seek(-(window as i64), Origin::End).is_err() {
        return OggTail::default();
    }
    let mut buf = vec![0u8; window as usize];
    match stream.read(&mut buf) {
        Ok(n) if n == buf.len() => {}
        _ => return OggTail::default(),
    }

    // Last capture pattern with a version-0 header that fits in the window.
    let mut best = None;
    let mut i = 0usize;
    while i + 27 <= buf.len() {
        if &buf[i..i + 4] == b"OggS" && buf[i + 4] == 0 {
            best = Some(i);
        }
        i += 1;
    }
    let Some(at) = best else { return OggTail::default() };

    let header_type = buf[at + 5];
    let granule = u64::from_le_bytes(buf[at + 6..at + 14].try_into().unwrap_or([0u8; 8]));
    OggTail {
        granule: (granule != u64::MAX).then_some(granule),
        end_of_stream: header_type & 0x04 != 0,
    }
}

pub struct VorbisDecoder {
    format: Box<dyn FormatReader>,
    codec: Box<dyn AudioDecoder>,
    track_id: u32,
    sample_rate: u32,
    total_samples: u64,
    decoded_samples: u64,
    end_of_stream_flagged: bool,
    finished: bool,
}

impl std::fmt::Debug for VorbisDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VorbisDecoder")
            .field("track_id", &self.track_id)
            .field("sample_rate", &self.sample_rate)
            .field("total_samples", &self.total_samples)
            .field("decoded_samples", &self.decoded_samples)
            .field("end_of_stream_flagged", &self.end_of_stream_flagged)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl VorbisDecoder {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, DecodeError> {
        let mut stream = Stream::open(path, mode).map_err(|e| DecodeError::Open(e.to_string()))?;
        let tail = scan_tail(&mut stream);
        stream
            .seek(0, Origin::Start)
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        let source = MediaSourceStream::new(Box::new(stream), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("ogg");

        let probed = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| DecodeError::Open(e.to_string()))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec == CODEC_TYPE_VORBIS)
            .ok_or_else(|| DecodeError::Open("NON_VORBIS_DATA_IN_BITSTREAM".to_string()))?;
        let params = track.codec_params.clone();
        let track_id = track.id;
        let sample_rate = params.sample_rate.unwrap_or(0);
        let total_samples = tail.granule.or(params.n_frames).unwrap_or(0);

        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        debug!(
            path = %path.display(),
            sample_rate,
            total_samples,
            end_of_stream = tail.end_of_stream,
            "opened Ogg-Vorbis stream"
        );
        Ok(VorbisDecoder {
            format,
            codec,
            track_id,
            sample_rate,
            total_samples,
            decoded_samples: 0,
            end_of_stream_flagged: tail.end_of_stream,
            finished: false,
        })
    }

    fn position(&self) -> Position {
        Position::from_samples(self.decoded_samples, self.sample_rate)
    }

    fn finish(&mut self) -> Result<u64, DecodeError> {
        self.finished = true;
        if !self.end_of_stream_flagged {
            // The physical stream ran out without the final page being
            // marked; the encode was cut off.
            return Err(DecodeError::Truncated { position: None });
        }
        Ok(0)
    }

    fn classify(&self, message: &str) -> DecodeError {
        let lower = message.to_ascii_lowercase();
        let position = self.position();
        if lower.contains("sync") || lower.contains("page") || lower.contains("hole") {
            // An interruption in the data: garbage between pages or a
            // corrupt page followed by recapture.
            DecodeError::LostSync { position: Some(position), id3v1_tag: false }
        } else if lower.contains("link") {
            DecodeError::Format(format!("OGG-VORBIS_EBADLINK @ {position}"))
        } else if lower.contains("header") {
            DecodeError::BadHeader(position)
        } else {
            DecodeError::Format(format!("VORBIS_ERROR ({message})"))
        }
    }
}

impl Decoder for VorbisDecoder {
    fn step(&mut self) -> Result<u64, DecodeError> {
        if self.finished {
            return Ok(0);
        }
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(EngineError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return self.finish();
                }
                Err(EngineError::ResetRequired) => return self.finish(),
                Err(EngineError::DecodeError(message)) => return Err(self.classify(message)),
                Err(EngineError::SeekError(_)) => return Err(DecodeError::Seek),
                Err(e) => return Err(DecodeError::Format(format!("VORBIS_ERROR ({e})"))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            return match self.codec.decode(&packet) {
                Ok(decoded) => {
                    let frames = decoded.frames() as u64;
                    self.decoded_samples += frames;
                    Ok(frames)
                }
                Err(EngineError::DecodeError(message)) => Err(self.classify(message)),
                Err(EngineError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    Err(DecodeError::Truncated { position: Some(self.position()) })
                }
                Err(e) => Err(DecodeError::Format(format!("VORBIS_ERROR ({e})"))),
            };
        }
    }

    fn total_units(&self) -> u64 {
        self.total_samples
    }
}
