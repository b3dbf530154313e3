use std::fmt;

use thiserror::Error;

/// A time offset into an audio stream, derived from the number of decoded
/// samples and the stream sample rate. Rendered as `{m}m {ss}s` in error
/// details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub minutes: u64,
    pub seconds: u64,
}

impl Position {
    pub fn from_samples(samples: u64, sample_rate: u32) -> Self {
        let total_seconds = if sample_rate > 0 {
            samples / u64::from(sample_rate)
        } else {
            0
        };
        Self::from_seconds(total_seconds)
    }

    pub fn from_seconds(total_seconds: u64) -> Self {
        Position {
            minutes: total_seconds / 60,
            seconds: total_seconds % 60,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m {:02}s", self.minutes, self.seconds)
    }
}

/// Everything that can go wrong while opening or draining a single file.
///
/// Decoders map their internal status codes onto this closed set; the
/// rendered `Display` text is what ends up next to the file in the final
/// report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The decoder's open sequence (stream open, header parse, metadata
    /// pre-read) failed. Carries the decoder-specific diagnostic.
    #[error("UNABLE_TO_OPEN_DECODER <{0}>")]
    Open(String),

    /// The stream ended before the declared payload did.
    #[error("{}", fmt_truncated(.position))]
    Truncated { position: Option<Position> },

    /// The decoder lost synchronization. `position: None` means the loss was
    /// discovered at end of file; `id3v1_tag` annotates the common case of a
    /// stray ID3v1 tag confusing the final frame.
    #[error("{}", fmt_lost_sync(.position, .id3v1_tag))]
    LostSync {
        position: Option<Position>,
        id3v1_tag: bool,
    },

    /// A corrupted frame header was encountered.
    #[error("BAD_HEADER @ {0}")]
    BadHeader(Position),

    /// Frame data did not match its embedded CRC.
    #[error("CRC_MISMATCH @ {0}")]
    CrcMismatch(Position),

    /// The decoded audio did not match the stored MD5 signature.
    #[error("MD5_MISMATCH")]
    Md5Mismatch,

    /// The decoded sample count diverged from the declared total.
    /// Negative delta means samples were missing, positive means extra.
    #[error("{}", fmt_sample_mismatch(.delta))]
    SampleCountMismatch { delta: i64 },

    /// Reserved or unknown fields in use; the stream cannot be walked.
    #[error("UNPARSEABLE_STREAM")]
    UnparseableStream,

    /// A metadata block or tag was corrupt. Carries the tag-specific token
    /// (for example `BAD_ID3v2_TAG`).
    #[error("{0}")]
    BadMetadata(String),

    #[error("SEEK_ERROR")]
    Seek,

    #[error("MEMORY_ALLOCATION_ERROR")]
    MemoryAllocation,

    #[error("DECODER_ABORTED")]
    Aborted,

    /// The file's extension is not in the recognized table.
    #[error("UNSUPPORTED_FORMAT")]
    Unsupported,

    /// Format-specific condition with its own diagnostic token.
    #[error("{0}")]
    Format(String),
}

fn fmt_truncated(position: &Option<Position>) -> String {
    match position {
        Some(pos) => format!("TRUNCATED @ {pos}"),
        None => "TRUNCATED".to_string(),
    }
}

fn fmt_lost_sync(position: &Option<Position>, id3v1_tag: &bool) -> String {
    match position {
        Some(pos) if *id3v1_tag => format!("LOST_SYNC @ {pos} <ID3v1_TAG_FOUND>"),
        Some(pos) => format!("LOST_SYNC @ {pos}"),
        None => "LOST_SYNC @ END_OF_FILE".to_string(),
    }
}

fn fmt_sample_mismatch(delta: &i64) -> String {
    let count = delta.unsigned_abs();
    let noun = if *delta < 0 { "MISSING_SAMPLE" } else { "EXTRA_SAMPLE" };
    let plural = if count == 1 { "" } else { "S" };
    format!("{count} {noun}{plural}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_formatting() {
        assert_eq!(Position::from_seconds(0).to_string(), "0m 00s");
        assert_eq!(Position::from_seconds(67).to_string(), "1m 07s");
        assert_eq!(Position::from_samples(44100 * 187, 44100).to_string(), "3m 07s");
        // Unknown sample rate degrades to the stream start.
        assert_eq!(Position::from_samples(5000, 0).to_string(), "0m 00s");
    }

    #[test]
    fn error_details_match_report_tokens() {
        assert_eq!(
            DecodeError::LostSync { position: None, id3v1_tag: false }.to_string(),
            "LOST_SYNC @ END_OF_FILE"
        );
        assert_eq!(
            DecodeError::LostSync {
                position: Some(Position::from_seconds(0)),
                id3v1_tag: true
            }
            .to_string(),
            "LOST_SYNC @ 0m 00s <ID3v1_TAG_FOUND>"
        );
        assert_eq!(
            DecodeError::SampleCountMismatch { delta: -1 }.to_string(),
            "1 MISSING_SAMPLE"
        );
        assert_eq!(
            DecodeError::SampleCountMismatch { delta: 576 }.to_string(),
            "576 EXTRA_SAMPLES"
        );
        assert_eq!(
            DecodeError::Truncated { position: Some(Position::from_seconds(65)) }.to_string(),
            "TRUNCATED @ 1m 05s"
        );
        assert_eq!(DecodeError::Open("no audio track".into()).to_string(),
            "UNABLE_TO_OPEN_DECODER <no audio track>");
        assert_eq!(DecodeError::BadMetadata("BAD_ID3v2_TAG".into()).to_string(), "BAD_ID3v2_TAG");
    }
}
