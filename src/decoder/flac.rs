//! FLAC validator.
//!
//! Drives the FLAC engine one packet at a time with MD5 verification
//! enabled, counts decoded samples against the STREAMINFO total, and maps
//! engine errors onto the report taxonomy with position stamps.

use std::path::Path;

use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_FLAC};
use symphonia::core::codecs::Decoder as AudioDecoder;
use symphonia::core::errors::Error as EngineError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::decoder::Decoder;
use crate::error::{DecodeError, Position};
use crate::stream::{OpenMode, Origin, Stream};

pub struct FlacDecoder {
    format: Box<dyn FormatReader>,
    codec: Box<dyn AudioDecoder>,
    track_id: u32,
    sample_rate: u32,
    /// STREAMINFO total; zero when the stream does not declare one.
    total_samples: u64,
    decoded_samples: u64,
    /// Whether the final 128 bytes of the file spell an ID3v1 tag,
    /// probed once at open for the end-of-stream LOST_SYNC annotation.
    id3v1_tail: bool,
    finished: bool,
}

impl std::fmt::Debug for FlacDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlacDecoder")
            .field("track_id", &self.track_id)
            .field("sample_rate", &self.sample_rate)
            .field("total_samples", &self.total_samples)
            .field("decoded_samples", &self.decoded_samples)
            .field("id3v1_tail", &self.id3v1_tail)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl FlacDecoder {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, DecodeError> {
        let mut stream = Stream::open(path, mode).map_err(|e| DecodeError::Open(e.to_string()))?;
        let id3v1_tail = has_id3v1_tail(&mut stream);
        stream
            .seek(0, Origin::Start)
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        let source = MediaSourceStream::new(Box::new(stream), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("flac");

        let probed = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| DecodeError::Open(e.to_string()))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec == CODEC_TYPE_FLAC)
            .ok_or_else(|| DecodeError::Open("no FLAC track in stream".to_string()))?;
        let params = track.codec_params.clone();
        let track_id = track.id;
        let sample_rate = params.sample_rate.unwrap_or(0);
        let total_samples = params.n_frames.unwrap_or(0);

        // MD5 verification over the decoded audio, reported at finalize.
        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions { verify: true, ..Default::default() })
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        debug!(
            path = %path.display(),
            sample_rate,
            total_samples,
            id3v1_tail,
            "opened FLAC stream"
        );
        Ok(FlacDecoder {
            format,
            codec,
            track_id,
            sample_rate,
            total_samples,
            decoded_samples: 0,
            id3v1_tail,
            finished: false,
        })
    }

    fn position(&self) -> Position {
        Position::from_samples(self.decoded_samples, self.sample_rate)
    }

    /// End-of-stream bookkeeping: MD5 verdict first, then the sample
    /// count against STREAMINFO.
    fn finish(&mut self) -> Result<u64, DecodeError> {
        self.finished = true;
        let finalized = self.codec.finalize();
        if finalized.verify_ok == Some(false) {
            return Err(DecodeError::Md5Mismatch);
        }
        if self.total_samples > 0 && self.decoded_samples != self.total_samples {
            return Err(DecodeError::SampleCountMismatch {
                delta: self.decoded_samples as i64 - self.total_samples as i64,
            });
        }
        Ok(0)
    }

    fn classify(&self, message: &str) -> DecodeError {
        let at_declared_end = self.sample_rate > 0
            && self.total_samples > 0
            && self.decoded_samples / u64::from(self.sample_rate)
                == self.total_samples / u64::from(self.sample_rate);
        classify_engine_message(message, self.position(), at_declared_end && self.id3v1_tail)
    }
}

impl Decoder for FlacDecoder {
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
                Err(e) => return Err(DecodeError::Format(format!("DECODER_ERROR ({e})"))),
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
                Err(e) => Err(DecodeError::Format(format!("DECODER_ERROR ({e})"))),
            };
        }
    }

    fn total_units(&self) -> u64 {
        self.total_samples
    }
}

/// Maps an engine diagnostic onto the error taxonomy. `annotate_id3v1` is
/// set when a sync loss at the declared end of stream coincides with an
/// ID3v1 tail, the common round-trip-through-a-tagger case.
fn classify_engine_message(message: &str, position: Position, annotate_id3v1: bool) -> DecodeError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("sync") {
        DecodeError::LostSync { position: Some(position), id3v1_tag: annotate_id3v1 }
    } else if lower.contains("crc") {
        DecodeError::CrcMismatch(position)
    } else if lower.contains("header") {
        DecodeError::BadHeader(position)
    } else if lower.contains("metadata") {
        DecodeError::BadMetadata("BAD_METADATA".to_string())
    } else if lower.contains("reserved") || lower.contains("unsupported") {
        DecodeError::UnparseableStream
    } else {
        DecodeError::Format(format!("DECODER_ERROR ({message})"))
    }
}

fn has_id3v1_tail(stream: &mut Stream) -> bool {
    if stream.seek(-128, Origin::End).is_err() {
        return false;
    }
    let mut tag = [0u8; 3];
    matches!(stream.read(&mut tag), Ok(3)) && &tag == b"TAG"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn engine_messages_classify() {
        let pos = Position::from_seconds(61);
        assert_eq!(
            classify_engine_message("flac: lost frame sync", pos, false),
            DecodeError::LostSync { position: Some(pos), id3v1_tag: false }
        );
        assert_eq!(
            classify_engine_message("flac: lost frame sync", pos, true),
            DecodeError::LostSync { position: Some(pos), id3v1_tag: true }
        );
        assert_eq!(
            classify_engine_message("flac: frame crc mismatch", pos, false),
            DecodeError::CrcMismatch(pos)
        );
        assert_eq!(
            classify_engine_message("flac: invalid frame header", pos, false),
            DecodeError::BadHeader(pos)
        );
        assert_eq!(
            classify_engine_message("flac: bad metadata block", pos, false),
            DecodeError::BadMetadata("BAD_METADATA".to_string())
        );
        assert_eq!(
            classify_engine_message("flac: reserved field in use", pos, false),
            DecodeError::UnparseableStream
        );
        assert!(matches!(
            classify_engine_message("something else", pos, false),
            DecodeError::Format(_)
        ));
    }

    #[test]
    fn garbage_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.flac");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x13u8; 2048])
            .unwrap();
        let err = FlacDecoder::open(&path, OpenMode::Buffered).unwrap_err();
        assert!(matches!(err, DecodeError::Open(_)), "{err}");
    }

    #[test]
    fn id3v1_tail_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.bin");
        let mut bytes = vec![0u8; 300];
        let at = bytes.len() - 128;
        bytes[at..at + 3].copy_from_slice(b"TAG");
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();
        let mut stream = Stream::open(&path, OpenMode::Buffered).unwrap();
        assert!(has_id3v1_tail(&mut stream));

        let path2 = dir.path().join("notail.bin");
        std::fs::File::create(&path2).unwrap().write_all(&vec![0u8; 300]).unwrap();
        let mut stream2 = Stream::open(&path2, OpenMode::Buffered).unwrap();
        assert!(!has_id3v1_tail(&mut stream2));
    }
}
