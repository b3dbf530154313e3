//! WavPack validator.
//!
//! Walks the WavPack container block by block and, for lossless integer
//! PCM streams, fully unpacks every block's samples: residual entropy
//! decode, decorrelation, joint-stereo undo, and the decoded-data CRC
//! carried in each block header. Unpacked samples are serialized into a
//! running MD5 that is compared against the checksum stored in the file's
//! metadata. Hybrid, float, and DSD streams fall back to structural
//! validation (sub-block chains, WavPack 5 block checksums, sample
//! accounting); their sample-level reconstruction needs the reference
//! codec's side streams.

use std::path::Path;

use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::decoder::Decoder;
use crate::error::DecodeError;
use crate::stream::{OpenMode, Origin, Stream};

mod unpack;
mod words;

#[cfg(test)]
pub(crate) mod testenc;

use unpack::{unpack_block, UnpackError};

const BLOCK_HEADER_SIZE: usize = 32;
const MIN_STREAM_VERSION: u16 = 0x402;
const MAX_STREAM_VERSION: u16 = 0x410;
/// Blocks never exceed one megabyte.
const MAX_BLOCK_SIZE: u32 = 1 << 20;
/// How far to scan for a block magic, both at open (self-extracting
/// stubs) and when resynchronizing mid-stream.
const MAX_SCAN_BYTES: u64 = 1 << 20;

// Block flags.
const BYTES_STORED_MASK: u32 = 0x3;
const MONO_FLAG: u32 = 0x4;
const HYBRID_FLAG: u32 = 0x8;
const JOINT_STEREO: u32 = 0x10;
const FLOAT_DATA: u32 = 0x80;
const INT32_DATA: u32 = 0x100;
const INITIAL_BLOCK: u32 = 0x800;
const FINAL_BLOCK: u32 = 0x1000;
const SHIFT_LSB: u32 = 13;
const SHIFT_MASK: u32 = 0x1F << SHIFT_LSB;
const FALSE_STEREO: u32 = 0x4000_0000;
const DSD_FLAG: u32 = 0x8000_0000;

// Metadata sub-block ids.
const ID_ODD_SIZE: u8 = 0x40;
const ID_LARGE: u8 = 0x80;
const ID_FUNCTION_MASK: u8 = 0x3F;
const ID_DECORR_TERMS: u8 = 0x02;
const ID_DECORR_WEIGHTS: u8 = 0x03;
const ID_DECORR_SAMPLES: u8 = 0x04;
const ID_ENTROPY_VARS: u8 = 0x05;
const ID_INT32_INFO: u8 = 0x09;
const ID_WV_BITSTREAM: u8 = 0x0A;
const ID_MD5_CHECKSUM: u8 = 0x26;
const ID_BLOCK_CHECKSUM: u8 = 0x2F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockHeader {
    /// Chunk size: total block bytes minus 8.
    size: u32,
    version: u16,
    /// Declared total samples per channel for the whole file; `None` when
    /// the field carries the unknown marker.
    total_samples: Option<u64>,
    block_index: u64,
    block_samples: u32,
    flags: u32,
    /// CRC of the decoded samples, before output scaling.
    crc: u32,
}

impl BlockHeader {
    fn parse(buf: &[u8]) -> Option<BlockHeader> {
        if buf.len() < BLOCK_HEADER_SIZE || &buf[0..4] != b"wvpk" {
            return None;
        }
        let size = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let version = u16::from_le_bytes(buf[8..10].try_into().ok()?);
        let block_index_hi = u64::from(buf[10]);
        let total_samples_hi = u64::from(buf[11]);
        let total_samples_lo = u32::from_le_bytes(buf[12..16].try_into().ok()?);
        let block_index_lo = u32::from_le_bytes(buf[16..20].try_into().ok()?);
        let block_samples = u32::from_le_bytes(buf[20..24].try_into().ok()?);
        let flags = u32::from_le_bytes(buf[24..28].try_into().ok()?);
        let crc = u32::from_le_bytes(buf[28..32].try_into().ok()?);
        let total_samples = (total_samples_lo != u32::MAX)
            .then(|| (total_samples_hi << 32) | u64::from(total_samples_lo));
        Some(BlockHeader {
            size,
            version,
            total_samples,
            block_index: (block_index_hi << 32) | u64::from(block_index_lo),
            block_samples,
            flags,
            crc,
        })
    }

    fn is_sane(&self) -> bool {
        (MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&self.version)
            && self.size >= (BLOCK_HEADER_SIZE as u32 - 8)
            && self.size < MAX_BLOCK_SIZE
    }

    /// Bytes following the 32-byte header.
    fn body_len(&self) -> u64 {
        u64::from(self.size) + 8 - BLOCK_HEADER_SIZE as u64
    }

    fn shift(&self) -> u32 {
        (self.flags & SHIFT_MASK) >> SHIFT_LSB
    }
}

/// The WavPack 5 block digest: 16-bit little-endian words folded with
/// `csum = csum * 3 + word`, initial value all-ones. `parts` are
/// concatenated before folding.
fn block_checksum(parts: &[&[u8]]) -> u32 {
    let mut csum: u32 = u32::MAX;
    let mut pending: Option<u8> = None;
    for part in parts {
        for &byte in *part {
            match pending.take() {
                None => pending = Some(byte),
                Some(low) => {
                    let word = u32::from(low) | (u32::from(byte) << 8);
                    csum = csum.wrapping_mul(3).wrapping_add(word);
                }
            }
        }
    }
    if let Some(low) = pending {
        csum = csum.wrapping_mul(3).wrapping_add(u32::from(low));
    }
    csum
}

/// One walk over a block's metadata chain: structural validity, the
/// optional block checksum verdict, and borrows of the sub-blocks the
/// sample decoder needs.
#[derive(Default)]
struct BlockScan<'a> {
    /// Chain well-formed and, when present, the block checksum matched.
    ok: bool,
    md5: Option<[u8; 16]>,
    terms: Option<&'a [u8]>,
    weights: Option<&'a [u8]>,
    samples: Option<&'a [u8]>,
    entropy: Option<&'a [u8]>,
    int32_info: Option<&'a [u8]>,
    bitstream: Option<&'a [u8]>,
}

fn scan_block<'a>(header_bytes: &[u8; BLOCK_HEADER_SIZE], body: &'a [u8]) -> BlockScan<'a> {
    let mut scan = BlockScan::default();
    let mut p = 0usize;
    while p < body.len() {
        let id = body[p];
        let head = if id & ID_LARGE != 0 { 4 } else { 2 };
        if p + head > body.len() {
            return scan; // malformed, ok stays false
        }
        let word_count = if id & ID_LARGE != 0 {
            usize::from(body[p + 1]) | usize::from(body[p + 2]) << 8 | usize::from(body[p + 3]) << 16
        } else {
            usize::from(body[p + 1])
        };
        let span = word_count * 2;
        if p + head + span > body.len() {
            return scan;
        }
        let data_len = span - usize::from(id & ID_ODD_SIZE != 0 && span > 0);
        let data = &body[p + head..p + head + data_len];
        match id & ID_FUNCTION_MASK {
            ID_MD5_CHECKSUM if data_len == 16 => {
                let mut md5 = [0u8; 16];
                md5.copy_from_slice(data);
                scan.md5 = Some(md5);
            }
            ID_DECORR_TERMS => scan.terms = Some(data),
            ID_DECORR_WEIGHTS => scan.weights = Some(data),
            ID_DECORR_SAMPLES => scan.samples = Some(data),
            ID_ENTROPY_VARS => scan.entropy = Some(data),
            ID_INT32_INFO => scan.int32_info = Some(data),
            ID_WV_BITSTREAM => scan.bitstream = Some(data),
            ID_BLOCK_CHECKSUM => {
                let csum = block_checksum(&[header_bytes, &body[..p + head]]);
                let matches = match data_len {
                    2 => {
                        let folded = (csum ^ (csum >> 16)) as u16;
                        folded == u16::from_le_bytes([data[0], data[1]])
                    }
                    4 => csum == u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                    _ => false,
                };
                if !matches {
                    return scan;
                }
            }
            _ => {}
        }
        p += head + span;
    }
    scan.ok = true;
    scan
}

/// Serializes unpacked sample words for the MD5, little-endian at the
/// stream's stored width. 8-bit PCM is biased to unsigned; DSD streams
/// (which would pass through unbiased) are never unpacked here.
pub(crate) fn serialize_samples(samples: &[i32], bytes_per_sample: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * bytes_per_sample as usize);
    for &sample in samples {
        let bytes = sample.to_le_bytes();
        match bytes_per_sample {
            1 => out.push((sample + 128) as u8),
            2 => out.extend_from_slice(&bytes[..2]),
            3 => out.extend_from_slice(&bytes[..3]),
            _ => out.extend_from_slice(&bytes),
        }
    }
    out
}

#[derive(Debug)]
pub struct WavPackDecoder {
    stream: Stream,
    correction: Option<Stream>,
    total_samples: Option<u64>,
    unpacked_samples: u64,
    error_count: u32,
    stored_md5: Option<[u8; 16]>,
    /// Running digest of unpacked samples; dropped as soon as any audio
    /// block cannot feed it (unsupported mode, multi-block channel chain,
    /// corruption).
    md5_state: Option<Md5>,
    dsd: bool,
    lossless: bool,
    bytes_per_sample: u32,
    correction_exhausted: bool,
    finished: bool,
}

impl WavPackDecoder {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, DecodeError> {
        let mut stream = Stream::open(path, mode).map_err(|e| DecodeError::Open(e.to_string()))?;
        let (first_pos, first) = find_first_block(&mut stream)
            .ok_or_else(|| DecodeError::Open("no WavPack block found".to_string()))?;

        // The declared total is only authoritative in the file's first
        // block chain.
        let total_samples = if first.block_index == 0 { first.total_samples } else { None };
        let hybrid = first.flags & HYBRID_FLAG != 0;
        let dsd = first.flags & DSD_FLAG != 0;

        // The optional correction file appends `c` to the full filename.
        let mut correction_name = path.as_os_str().to_os_string();
        correction_name.push("c");
        let correction = Stream::open(Path::new(&correction_name), mode).ok();

        stream
            .seek(first_pos as i64, Origin::Start)
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        let lossless = !hybrid || correction.is_some();
        debug!(
            path = %path.display(),
            total_samples,
            hybrid,
            dsd,
            correction = correction.is_some(),
            "opened WavPack stream"
        );
        Ok(WavPackDecoder {
            stream,
            correction,
            total_samples,
            unpacked_samples: 0,
            error_count: 0,
            stored_md5: None,
            md5_state: Some(Md5::new()),
            dsd,
            lossless,
            bytes_per_sample: (first.flags & BYTES_STORED_MASK) + 1,
            correction_exhausted: false,
            finished: false,
        })
    }

    fn total_reached(&self) -> bool {
        matches!(self.total_samples, Some(total) if self.unpacked_samples >= total)
    }

    /// Consumes correction-stream blocks up to and including the chain
    /// pairing with the main block at `block_index`, verifying each.
    fn pair_correction_block(&mut self, block_index: u64) -> bool {
        if self.correction_exhausted {
            return true; // already counted once
        }
        let Some(wvc) = self.correction.as_mut() else { return true };
        loop {
            if wvc.tell() >= wvc.len() {
                warn!("correction stream ended before the main stream");
                self.correction_exhausted = true;
                return false;
            }
            let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
            let header = match wvc.read(&mut header_bytes) {
                Ok(n) if n == BLOCK_HEADER_SIZE => BlockHeader::parse(&header_bytes),
                _ => None,
            };
            let Some(header) = header.filter(BlockHeader::is_sane) else {
                self.correction_exhausted = true;
                return false;
            };
            let body_len = header.body_len();
            let mut body = vec![0u8; body_len as usize];
            match wvc.read(&mut body) {
                Ok(n) if n as u64 == body_len => {}
                _ => {
                    self.correction_exhausted = true;
                    return false;
                }
            }
            // Correction blocks carry their own checksum sub-blocks;
            // sample data and MD5 live in the main stream only.
            if !scan_block(&header_bytes, &body).ok {
                return false;
            }
            if header.flags & INITIAL_BLOCK != 0 && header.block_samples > 0 {
                return header.block_index == block_index;
            }
        }
    }

    /// Scans forward for the next block magic after a broken block.
    /// Positions the stream at the candidate, or finishes the walk when
    /// none is found within the scan budget.
    fn resync_from(&mut self, from: u64) -> Result<u64, DecodeError> {
        let limit = self.stream.len().min(from + MAX_SCAN_BYTES);
        let mut pos = from;
        let mut chunk = vec![0u8; 65_536];
        while pos + BLOCK_HEADER_SIZE as u64 <= limit {
            if self.stream.seek(pos as i64, Origin::Start).is_err() {
                break;
            }
            let got = match self.stream.read(&mut chunk) {
                Ok(n) if n >= 4 => n,
                _ => break,
            };
            for i in 0..got - 3 {
                if &chunk[i..i + 4] == b"wvpk" {
                    let candidate = pos + i as u64;
                    if self.stream.seek(candidate as i64, Origin::Start).is_ok() {
                        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
                        if matches!(self.stream.read(&mut header_bytes), Ok(n) if n == BLOCK_HEADER_SIZE)
                            && BlockHeader::parse(&header_bytes)
                                .filter(BlockHeader::is_sane)
                                .is_some()
                            && self.stream.seek(candidate as i64, Origin::Start).is_ok()
                        {
                            return Ok(1);
                        }
                    }
                }
            }
            pos += (got - 3) as u64;
        }
        self.finish()
    }

    /// End-of-walk classification: bad blocks first, then the sample
    /// total, then the MD5 comparison.
    fn finish(&mut self) -> Result<u64, DecodeError> {
        self.finished = true;
        if self.error_count > 0 {
            let n = self.error_count;
            let plural = if n == 1 { "" } else { "S" };
            return Err(DecodeError::Format(format!("{n} BAD_BLOCK{plural}")));
        }
        match self.total_samples {
            None => Err(DecodeError::Format("SAMPLE_COUNT_UNKNOWN_ERROR".to_string())),
            Some(total) if self.unpacked_samples != total => Err(DecodeError::SampleCountMismatch {
                delta: self.unpacked_samples as i64 - total as i64,
            }),
            Some(_) => {
                if let (Some(hasher), Some(stored)) = (self.md5_state.take(), self.stored_md5) {
                    let computed = hasher.finalize();
                    if computed.as_slice() != stored.as_slice() {
                        debug!(
                            lossless = self.lossless,
                            dsd = self.dsd,
                            bytes_per_sample = self.bytes_per_sample,
                            "stored MD5 does not match unpacked audio"
                        );
                        return Err(DecodeError::Md5Mismatch);
                    }
                }
                Ok(0)
            }
        }
    }
}

impl Decoder for WavPackDecoder {
    fn step(&mut self) -> Result<u64, DecodeError> {
        if self.finished {
            return Ok(0);
        }
        let pos = self.stream.tell();
        if pos >= self.stream.len() {
            return self.finish();
        }

        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        match self.stream.read(&mut header_bytes) {
            Ok(n) if n == BLOCK_HEADER_SIZE => {}
            _ => {
                // Trailing bytes shorter than a header: benign once the
                // declared total has been reached (appended tags), a bad
                // block otherwise.
                if !self.total_reached() {
                    self.error_count += 1;
                }
                return self.finish();
            }
        }
        let Some(header) = BlockHeader::parse(&header_bytes).filter(BlockHeader::is_sane) else {
            if self.total_reached() {
                // Appended tag data after the audio payload.
                return self.finish();
            }
            self.error_count += 1;
            return self.resync_from(pos + 1);
        };

        let body_len = header.body_len();
        if pos + BLOCK_HEADER_SIZE as u64 + body_len > self.stream.len() {
            warn!(pos, "WavPack block cut off at end of file");
            self.error_count += 1;
            return self.finish();
        }
        let mut body = vec![0u8; body_len as usize];
        match self.stream.read(&mut body) {
            Ok(n) if n as u64 == body_len => {}
            _ => {
                self.error_count += 1;
                return self.finish();
            }
        }

        let scan = scan_block(&header_bytes, &body);
        if let Some(md5) = scan.md5 {
            self.stored_md5 = Some(md5);
        }
        if !scan.ok {
            self.error_count += 1;
        } else if header.block_samples > 0 {
            let single_chain = header.flags & INITIAL_BLOCK != 0 && header.flags & FINAL_BLOCK != 0;
            if single_chain {
                match unpack_block(&header, &scan) {
                    Ok(samples) => {
                        if let Some(hasher) = self.md5_state.as_mut() {
                            hasher.update(serialize_samples(&samples, self.bytes_per_sample));
                        }
                    }
                    Err(UnpackError::Corrupt) => {
                        self.error_count += 1;
                        self.md5_state = None;
                    }
                    Err(UnpackError::Unsupported) => {
                        self.md5_state = None;
                    }
                }
            } else {
                // Multi-block channel chains interleave across blocks;
                // the digest cannot be maintained per block.
                self.md5_state = None;
            }
        }

        let mut units = 1u64;
        if header.flags & INITIAL_BLOCK != 0 && header.block_samples > 0 {
            self.unpacked_samples += u64::from(header.block_samples);
            units = u64::from(header.block_samples);
            if !self.pair_correction_block(header.block_index) {
                self.error_count += 1;
            }
        }
        Ok(units)
    }

    fn total_units(&self) -> u64 {
        self.total_samples.unwrap_or(0)
    }
}

fn find_first_block(stream: &mut Stream) -> Option<(u64, BlockHeader)> {
    let window = stream.len().min(MAX_SCAN_BYTES);
    if window < BLOCK_HEADER_SIZE as u64 {
        return None;
    }
    stream.seek(0, Origin::Start).ok()?;
    let mut buf = vec![0u8; window as usize];
    match stream.read(&mut buf) {
        Ok(n) if n == buf.len() => {}
        _ => return None,
    }
    for i in 0..=buf.len() - BLOCK_HEADER_SIZE {
        if &buf[i..i + 4] == b"wvpk" {
            if let Some(header) = BlockHeader::parse(&buf[i..i + BLOCK_HEADER_SIZE]) {
                if header.is_sane() {
                    return Some((i as u64, header));
                }
            }
        }
    }
    None
}
