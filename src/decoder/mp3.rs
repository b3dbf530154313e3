//! MPEG audio frame walker.
//!
//! Validates an MPEG-1/2/2.5 Audio Layer I/II/III stream at the frame
//! level without reconstructing samples: a file is valid when it can be
//! walked header-by-header from the end of any leading ID3v2 tag to the
//! start of any trailing tags, with every frame header chain-consistent
//! with the first and every protected Layer III frame passing its CRC.

use std::path::Path;

use tracing::debug;

use crate::decoder::Decoder;
use crate::error::{DecodeError, Position};
use crate::stream::{OpenMode, Origin, Stream};

/// Bitrates in kbit/s. Rows are the 4-bit bitrate index; columns are
/// {MPEG1-I, MPEG1-II, MPEG1-III, MPEG2-I, MPEG2-{II,III}}. The free and
/// bad rows are zero.
const BITRATES_KBPS: [[u32; 5]; 16] = [
    [0, 0, 0, 0, 0],
    [32, 32, 32, 32, 8],
    [64, 48, 40, 48, 16],
    [96, 56, 48, 56, 24],
    [128, 64, 56, 64, 32],
    [160, 80, 64, 80, 40],
    [192, 96, 80, 96, 48],
    [224, 112, 96, 112, 56],
    [256, 128, 112, 128, 64],
    [288, 160, 128, 144, 80],
    [320, 192, 160, 160, 96],
    [352, 224, 192, 176, 112],
    [384, 256, 224, 192, 128],
    [416, 320, 256, 224, 144],
    [448, 384, 320, 256, 160],
    [0, 0, 0, 0, 0],
];

/// Sample rates in Hz. Rows are the 2-bit index; columns are
/// {MPEG1, MPEG2, MPEG2.5}. The reserved row is zero.
const SAMPLE_RATES_HZ: [[u32; 3]; 4] = [
    [44100, 22050, 11025],
    [48000, 24000, 12000],
    [32000, 16000, 8000],
    [0, 0, 0],
];

/// CRC-covered side-info byte counts, indexed
/// `[channel_mono][version_non_mpeg1]`.
const CRC_BYTE_SIZE: [[usize; 2]; 2] = [[17, 9], [9, 9]];

/// Version, layer, sample-rate index, and channel mode of two headers must
/// agree for them to belong to the same frame chain.
const CHAIN_MASK: u32 = 0xFFFE_0C00;

/// Per-file cap on one-byte resynchronization slides.
const MAX_RESYNC_ATTEMPTS: u32 = 65_536;

const APE_FOOTER_BYTES: i64 = 32;
const APE_HAS_HEADER_FLAG: u32 = 0x8000_0000;

// Raw header field codes.
const VERSION_MPEG1: u32 = 3;
const LAYER_I: u32 = 3;
const LAYER_II: u32 = 2;
const LAYER_III: u32 = 1;

/// Fields of one parsed frame header.
struct FrameInfo {
    length: u64,
    samples: u32,
    sample_rate: u32,
    version: u32,
    layer: u32,
    mono: bool,
    protected: bool,
}

/// Parses a 32-bit frame header. `None` for anything that cannot yield a
/// frame length: bad sync, reserved version/layer, free or bad bitrate,
/// reserved sample rate.
fn parse_frame_header(header: u32) -> Option<FrameInfo> {
    if header <= 0xFFE0_0000 {
        return None;
    }
    let version = (header >> 19) & 0x3;
    let layer = (header >> 17) & 0x3;
    let bitrate_index = ((header >> 12) & 0xF) as usize;
    let rate_index = ((header >> 10) & 0x3) as usize;
    let padding = (header >> 9) & 0x1;
    let mono = ((header >> 6) & 0x3) == 0x3;
    let protected = ((header >> 16) & 0x1) == 0;

    let bitrate_column = match (version, layer) {
        (VERSION_MPEG1, LAYER_I) => 0,
        (VERSION_MPEG1, LAYER_II) => 1,
        (VERSION_MPEG1, LAYER_III) => 2,
        (2 | 0, LAYER_I) => 3,
        (2 | 0, LAYER_II | LAYER_III) => 4,
        _ => return None,
    };
    let kbps = BITRATES_KBPS[bitrate_index][bitrate_column];
    if kbps == 0 {
        return None;
    }
    let bitrate = kbps * 1000;

    let rate_column = match version {
        VERSION_MPEG1 => 0,
        2 => 1,
        0 => 2,
        _ => return None,
    };
    let sample_rate = SAMPLE_RATES_HZ[rate_index][rate_column];
    if sample_rate == 0 {
        return None;
    }

    let (length, samples) = match layer {
        LAYER_I => ((u64::from(12 * bitrate / sample_rate + padding)) * 4, 384),
        LAYER_II => (u64::from(144 * bitrate / sample_rate + padding), 1152),
        LAYER_III if version == VERSION_MPEG1 => {
            (u64::from(144 * bitrate / sample_rate + padding), 1152)
        }
        LAYER_III => (u64::from(72 * bitrate / sample_rate + padding), 576),
        _ => return None,
    };

    Some(FrameInfo { length, samples, sample_rate, version, layer, mono, protected })
}

/// CRC-16 with initial value `0xFFFF` and polynomial `0x8005`, processed
/// most-significant bit first, as embedded in protected MPEG frames.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

pub struct Mp3Decoder {
    stream: Stream,
    /// File length minus the trailing-tag footer; the walk must land here
    /// exactly.
    file_end: u64,
    /// Byte offset of the next frame start.
    offset: u64,
    header: u32,
    previous_header: u32,
    stream_sample_rate: u32,
    /// Frame-sample counter, drives the position stamps in errors.
    sample_position: u64,
    tag_header_len: u64,
    /// Malformed-tag error discovered at open, surfaced on the first
    /// failed frame instead of attempting resynchronization.
    pending_error: Option<DecodeError>,
    resync_budget: u32,
}

impl Mp3Decoder {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, DecodeError> {
        let stream = Stream::open(path, mode).map_err(|e| DecodeError::Open(e.to_string()))?;
        let len = stream.len();
        let mut decoder = Mp3Decoder {
            stream,
            file_end: len,
            offset: 0,
            header: 0,
            previous_header: 0,
            stream_sample_rate: 0,
            sample_position: 0,
            tag_header_len: 0,
            pending_error: None,
            resync_budget: MAX_RESYNC_ATTEMPTS,
        };

        decoder.tag_header_len = decoder.id3v2_header_length();
        let footer_len = decoder.tag_footer_length();
        decoder.file_end = len.saturating_sub(footer_len);

        if decoder.stream.seek(decoder.tag_header_len as i64, Origin::Start).is_err() {
            // A declared tag length running past the file; walk from the top
            // and let frame parsing report it.
            decoder.tag_header_len = 0;
            let _ = decoder.stream.seek(0, Origin::Start);
        }
        decoder.offset = decoder.tag_header_len;

        debug!(
            path = %path.display(),
            header = decoder.tag_header_len,
            footer = footer_len,
            "opened MPEG stream"
        );
        Ok(decoder)
    }

    /// Parses `self.header`, crediting the frame-sample counter on success
    /// (tentative resynchronization candidates count too, matching the
    /// position stamps of the reference behavior).
    fn try_parse(&mut self) -> Option<FrameInfo> {
        let frame = parse_frame_header(self.header)?;
        self.sample_position += u64::from(frame.samples);
        Some(frame)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        matches!(self.stream.read(buf), Ok(n) if n == buf.len())
    }

    /// ID3v2 tag length from the first 10 bytes, zero when absent. A
    /// present marker with invalid length fields records a pending
    /// `BAD_ID3v2_TAG`.
    fn id3v2_header_length(&mut self) -> u64 {
        let mut buf = [0u8; 10];
        if !self.read_exact(&mut buf) || &buf[0..3] != b"ID3" {
            return 0;
        }
        let mut len = 0u64;
        if buf[3] < 0xff
            && buf[4] < 0xff
            && buf[6] < 0x80
            && buf[7] < 0x80
            && buf[8] < 0x80
            && buf[9] < 0x80
        {
            len = (u64::from(buf[6]) << 21)
                | (u64::from(buf[7]) << 14)
                | (u64::from(buf[8]) << 7)
                | u64::from(buf[9]);
            // ID3v2.4 with the footer flag carries 10 trailing bytes too.
            len += if buf[3] == 4 && buf[5] & 0x10 != 0 { 20 } else { 10 };
        }
        if len == 0 {
            self.pending_error = Some(DecodeError::BadMetadata("BAD_ID3v2_TAG".into()));
        }
        len
    }

    /// Total length of trailing tags: ID3v1, LYRICS3v1/v2, APE.
    fn tag_footer_length(&mut self) -> u64 {
        // Negative byte offset from the end, accumulated tag by tag.
        let mut offset: i64 = 0;

        // ID3v1: fixed 128 bytes spelling "TAG".
        if self.stream.seek(-128, Origin::End).is_ok() {
            let mut tag = [0u8; 3];
            if self.read_exact(&mut tag) && &tag == b"TAG" {
                offset -= 128;
                if self.stream.seek(offset - 9, Origin::End).is_ok() {
                    offset -= self.lyrics_tag_length() as i64;
                }
            }
        }

        // APE: 32-byte footer with magic and a size field covering the tag
        // minus its optional 32-byte header.
        if self.stream.seek(offset - APE_FOOTER_BYTES, Origin::End).is_ok() {
            let mut footer = [0u8; 32];
            if self.read_exact(&mut footer) && &footer[0..8] == b"APETAGEX" {
                let size = i64::from(u32::from_le_bytes([
                    footer[12], footer[13], footer[14], footer[15],
                ]));
                let flags =
                    u32::from_le_bytes([footer[20], footer[21], footer[22], footer[23]]);
                if size < APE_FOOTER_BYTES || size as u64 > self.stream.len() {
                    self.pending_error =
                        Some(DecodeError::BadMetadata("BAD_APE_TAG".into()));
                } else {
                    offset -= size;
                    if flags & APE_HAS_HEADER_FLAG != 0 {
                        offset -= APE_FOOTER_BYTES;
                    }
                    if self.stream.seek(offset - 9, Origin::End).is_ok() {
                        offset -= self.lyrics_tag_length() as i64;
                    }
                }
            }
        }

        (-offset) as u64
    }

    /// Length of a LYRICS3 block ending at the current position + 9, zero
    /// when absent. Expects the stream positioned 9 bytes before the block
    /// terminator.
    fn lyrics_tag_length(&mut self) -> u64 {
        let mut name = [0u8; 9];
        if !self.read_exact(&mut name) {
            return 0;
        }
        if &name == b"LYRICSEND" {
            // LYRICS3v1: no length field; the begin marker sits within 5100
            // bytes upstream.
            const SEARCH: i64 = 5100;
            if self.stream.seek(-SEARCH, Origin::Current).is_ok() {
                let mut buf = vec![0u8; SEARCH as usize];
                if self.read_exact(&mut buf) {
                    if let Some(at) = find_subsequence(&buf, b"LYRICSBEGIN") {
                        return (SEARCH as usize - at) as u64;
                    }
                    self.pending_error =
                        Some(DecodeError::BadMetadata("BAD_LYRICS3v1_TAG".into()));
                }
            }
        } else if &name == b"LYRICS200" {
            // LYRICS3v2: 6-digit ASCII length just before the terminator,
            // counting from the begin marker.
            if self.stream.seek(-15, Origin::Current).is_ok() {
                let mut digits = [0u8; 6];
                if self.read_exact(&mut digits) {
                    let declared = std::str::from_utf8(&digits)
                        .ok()
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .unwrap_or(0);
                    let mut begin = [0u8; 11];
                    if declared != 0
                        && self.stream.seek(-(6 + declared), Origin::Current).is_ok()
                        && self.read_exact(&mut begin)
                        && &begin == b"LYRICSBEGIN"
                    {
                        return (declared + 15) as u64;
                    }
                    self.pending_error =
                        Some(DecodeError::BadMetadata("BAD_LYRICS3v2_TAG".into()));
                }
            }
        }
        0
    }

    /// Verifies the embedded CRC of a protected Layer III frame. Called
    /// with the stream just past the 4 header bytes. Passes silently when
    /// any backing byte cannot be read; only a fully-read mismatch fails.
    fn check_crc(&mut self, frame: &FrameInfo) -> Result<(), DecodeError> {
        if !frame.protected || frame.layer != LAYER_III {
            return Ok(());
        }
        let side_info_len =
            CRC_BYTE_SIZE[usize::from(frame.mono)][usize::from(frame.version != VERSION_MPEG1)];

        // The CRC covers the last two header bytes plus the side info that
        // follows the embedded checksum.
        let mut covered = vec![0u8; side_info_len + 2];
        if self.stream.seek(-2, Origin::Current).is_err() {
            return Ok(());
        }
        let head_ok = self.read_exact_slice(&mut covered, 0, 2);
        let mut crc_bytes = [0u8; 2];
        let crc_ok = self.read_exact(&mut crc_bytes);
        let side_ok = self.read_exact_slice(&mut covered, 2, side_info_len);

        if head_ok && crc_ok && side_ok {
            let embedded = u16::from_be_bytes(crc_bytes);
            if crc16(&covered) != embedded {
                return Err(DecodeError::CrcMismatch(Position::from_samples(
                    self.sample_position,
                    self.stream_sample_rate,
                )));
            }
        }
        Ok(())
    }

    fn read_exact_slice(&mut self, buf: &mut [u8], start: usize, len: usize) -> bool {
        matches!(self.stream.read(&mut buf[start..start + len]), Ok(n) if n == len)
    }

    /// Slides a one-byte window forward until a chain-consistent frame
    /// header is recognized. A candidate with no previous header is
    /// stashed as tentative and the slide continues. Bounded by the
    /// per-file attempt budget.
    fn resynchronize(&mut self) -> bool {
        loop {
            self.header = 0;
            loop {
                if self.resync_budget == 0 {
                    return false;
                }
                self.resync_budget -= 1;
                let mut byte = [0u8; 1];
                if !self.read_exact(&mut byte) {
                    return false;
                }
                self.header = (self.header << 8) | u32::from(byte[0]);
                if self.try_parse().is_some() {
                    break;
                }
            }
            if self.previous_header > 0 {
                if self.header & CHAIN_MASK == self.previous_header & CHAIN_MASK {
                    return true;
                }
                // Mismatched candidate: keep sliding.
            } else {
                self.previous_header = self.header;
            }
        }
    }

    /// Invoked when the bytes at the current offset do not continue the
    /// frame chain. Always yields the error for this file.
    fn desynchronized(&mut self) -> DecodeError {
        if let Some(pending) = self.pending_error.take() {
            return pending;
        }
        if self.sample_position > 0 {
            if self.resynchronize() {
                DecodeError::LostSync {
                    position: Some(Position::from_samples(
                        self.sample_position,
                        self.stream_sample_rate,
                    )),
                    id3v1_tag: false,
                }
            } else {
                DecodeError::LostSync { position: None, id3v1_tag: false }
            }
        } else if !self.resynchronize() {
            DecodeError::Format("UNRECOGNIZED_FORMAT".into())
        } else if self.tag_header_len > 0 {
            DecodeError::BadMetadata("BAD_ID3v2_TAG".into())
        } else {
            DecodeError::Format("BAD_STARTING_SYNC".into())
        }
    }
}

impl Decoder for Mp3Decoder {
    fn step(&mut self) -> Result<u64, DecodeError> {
        let mut header_bytes = [0u8; 4];
        if !self.read_exact(&mut header_bytes) {
            return Err(DecodeError::LostSync { position: None, id3v1_tag: false });
        }
        self.header = u32::from_be_bytes(header_bytes);

        if let Some(frame) = self.try_parse() {
            if self.header & CHAIN_MASK == self.previous_header & CHAIN_MASK
                || self.previous_header == 0
            {
                if self.previous_header == 0 {
                    self.previous_header = self.header;
                    self.stream_sample_rate = frame.sample_rate;
                }
                self.offset += frame.length;
                if self.offset < self.file_end {
                    self.check_crc(&frame)?;
                    self.stream
                        .seek(self.offset as i64, Origin::Start)
                        .map_err(|_| DecodeError::Seek)?;
                    return Ok(frame.length);
                } else if self.offset == self.file_end {
                    self.check_crc(&frame)?;
                    return Ok(0);
                }
                // The frame would run past the scanned region.
                return Err(DecodeError::Truncated { position: None });
            }
        }
        Err(self.desynchronized())
    }

    fn total_units(&self) -> u64 {
        self.file_end
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
