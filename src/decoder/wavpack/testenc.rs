//! Test-only WavPack block writer: the exact inverse of the residual
//! decoder and block walker, used to synthesize fixtures. Medians start
//! at zero, weights at zero, history at zero, so every stored log2 field
//! is exact.

use md5::{Digest, Md5};

use super::unpack::{apply_weight, update_weight};
use super::words::{dec_med, get_med, inc_med, LIMIT_ONES};
use super::{
    block_checksum, serialize_samples, BLOCK_HEADER_SIZE, FINAL_BLOCK, ID_BLOCK_CHECKSUM,
    ID_DECORR_SAMPLES, ID_DECORR_TERMS, ID_DECORR_WEIGHTS, ID_ENTROPY_VARS, ID_LARGE,
    ID_MD5_CHECKSUM, ID_ODD_SIZE, ID_WV_BITSTREAM, INITIAL_BLOCK, MONO_FLAG,
};

/// LSB-first bit writer, the mirror of the decoder's reader.
pub(crate) struct BitWriter {
    data: Vec<u8>,
    bit: u32,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        BitWriter { data: Vec::new(), bit: 0 }
    }

    pub(crate) fn put_bit(&mut self, bit: u32) {
        if self.bit == 0 {
            self.data.push(0);
        }
        if bit != 0 {
            *self.data.last_mut().unwrap() |= 1 << self.bit;
        }
        self.bit = (self.bit + 1) % 8;
    }

    pub(crate) fn put_bits(&mut self, value: u32, count: u32) {
        for i in 0..count {
            self.put_bit((value >> i) & 1);
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.data
    }
}

fn coded_magnitude(value: i32) -> u32 {
    if value < 0 {
        !value as u32
    } else {
        value as u32
    }
}

/// Bucket index, bucket base, and in-bucket maxcode for a magnitude under
/// the current medians; the decoder derives the same triple from the
/// transmitted bucket.
fn bucket_bounds(medians: &[u32; 3], avalue: u32) -> (u32, u32, u32) {
    let m0 = get_med(medians, 0);
    if avalue < m0 {
        return (0, 0, m0 - 1);
    }
    let m1 = get_med(medians, 1);
    if avalue < m0 + m1 {
        return (1, m0, m1 - 1);
    }
    let m2 = get_med(medians, 2);
    let base = m0 + m1;
    if avalue < base + m2 {
        return (2, base, m2 - 1);
    }
    let bucket = 2 + (avalue - base) / m2;
    let low = base.wrapping_add((bucket - 2).wrapping_mul(m2));
    (bucket, low, m2 - 1)
}

fn apply_updates(medians: &mut [u32; 3], bucket: u32) {
    match bucket {
        0 => dec_med(medians, 0),
        1 => {
            inc_med(medians, 0);
            dec_med(medians, 1);
        }
        2 => {
            inc_med(medians, 0);
            inc_med(medians, 1);
            dec_med(medians, 2);
        }
        _ => {
            inc_med(medians, 0);
            inc_med(medians, 1);
            inc_med(medians, 2);
        }
    }
}

struct WordsEncoder {
    bits: BitWriter,
    medians: [[u32; 3]; 2],
    holding_one: bool,
    holding_zero: bool,
    zeros_acc: u32,
}

impl WordsEncoder {
    fn put_egc(&mut self, n: u32) {
        if n < 2 {
            for _ in 0..n {
                self.bits.put_bit(1);
            }
            self.bits.put_bit(0);
            return;
        }
        let length = 32 - n.leading_zeros();
        for _ in 0..length {
            self.bits.put_bit(1);
        }
        self.bits.put_bit(0);
        self.bits.put_bits(n & ((1 << (length - 1)) - 1), length - 1);
    }

    fn put_unary(&mut self, raw: u32) {
        if raw < LIMIT_ONES {
            for _ in 0..raw {
                self.bits.put_bit(1);
            }
            self.bits.put_bit(0);
        } else {
            for _ in 0..LIMIT_ONES {
                self.bits.put_bit(1);
            }
            self.bits.put_bit(0);
            self.put_egc(raw - LIMIT_ONES);
        }
    }

    fn write_code(&mut self, value: u32, maxcode: u32) {
        let bitcount = 32 - maxcode.leading_zeros();
        if bitcount == 0 {
            return;
        }
        let extras = ((1u64 << bitcount) - u64::from(maxcode) - 1) as u32;
        if value < extras {
            self.bits.put_bits(value, bitcount - 1);
        } else {
            let wide = value + extras;
            self.bits.put_bits(wide >> 1, bitcount - 1);
            self.bits.put_bit(wide & 1);
        }
    }

    fn encode_all(&mut self, residuals: &[i32], mono: bool) {
        let channels = if mono { 1 } else { 2 };
        let mut i = 0usize;
        while i < residuals.len() {
            if self.medians[0][0] < 2
                && (mono || self.medians[1][0] < 2)
                && !self.holding_one
                && !self.holding_zero
            {
                if self.zeros_acc > 0 {
                    self.zeros_acc -= 1;
                    if self.zeros_acc > 0 {
                        debug_assert_eq!(residuals[i], 0);
                        i += 1;
                        continue;
                    }
                } else {
                    let run = residuals[i..].iter().take_while(|&&v| v == 0).count() as u32;
                    self.put_egc(run);
                    if run > 0 {
                        self.zeros_acc = run;
                        self.medians = [[0; 3]; 2];
                        i += 1;
                        continue;
                    }
                }
            }

            let channel = i % channels;
            let avalue = coded_magnitude(residuals[i]);
            let (bucket, low, maxcode) = bucket_bounds(&self.medians[channel], avalue);
            let mut updated = self.medians;
            apply_updates(&mut updated[channel], bucket);

            if self.holding_zero {
                debug_assert_eq!(bucket, 0);
                self.holding_zero = false;
            } else {
                // The raw count's parity pre-announces whether the next
                // sample's bucket is nonzero; a zero parity lets the next
                // code ride for free.
                let parity = if i + 1 < residuals.len() {
                    let next_channel = (i + 1) % channels;
                    let next_avalue = coded_magnitude(residuals[i + 1]);
                    u32::from(next_avalue >= get_med(&updated[next_channel], 0))
                } else {
                    0
                };
                let raw = if self.holding_one {
                    (bucket - 1) * 2 + parity
                } else {
                    bucket * 2 + parity
                };
                self.put_unary(raw);
                self.holding_one = parity == 1;
                self.holding_zero = !self.holding_one;
            }

            self.medians = updated;
            self.write_code(avalue.wrapping_sub(low), maxcode);
            self.bits.put_bit(u32::from(residuals[i] < 0));
            i += 1;
        }
    }
}

pub(crate) fn encode_residuals(residuals: &[i32], mono: bool) -> Vec<u8> {
    let mut encoder = WordsEncoder {
        bits: BitWriter::new(),
        medians: [[0; 3]; 2],
        holding_one: false,
        holding_zero: false,
        zeros_acc: 0,
    };
    encoder.encode_all(residuals, mono);
    encoder.bits.finish()
}

/// Forward decorrelation: the prediction the decoder will add back is
/// subtracted here, with identical weight updates and history.
fn forward_decorr(samples: &[i32], mono: bool, term: i8, delta: i32) -> Vec<i32> {
    assert!(matches!(term, 1..=8 | 17 | 18));
    let channels = if mono { 1 } else { 2 };
    let mut weight = [0i32; 2];
    let mut history = [[0i32; 8]; 2];
    let mut pos = 0usize;
    let mut residuals = vec![0i32; samples.len()];
    for i in 0..samples.len() {
        let channel = i % channels;
        let sam = match term {
            17 => 2 * history[channel][0] - history[channel][1],
            18 => (3 * history[channel][0] - history[channel][1]) >> 1,
            t => history[channel][(pos + 8 - t as usize) % 8],
        };
        let residual = samples[i].wrapping_sub(apply_weight(weight[channel], sam));
        update_weight(&mut weight[channel], delta, sam, residual);
        if term > 8 {
            history[channel][1] = history[channel][0];
            history[channel][0] = samples[i];
        } else {
            history[channel][pos % 8] = samples[i];
        }
        residuals[i] = residual;
        if channel == channels - 1 {
            pos += 1;
        }
    }
    residuals
}

fn sub_block(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    let odd = data.len() % 2 == 1;
    let words = (data.len() + 1) / 2;
    let id = id | if odd { ID_ODD_SIZE } else { 0 };
    if words < 256 {
        out.push(id);
        out.push(words as u8);
    } else {
        out.push(id | ID_LARGE);
        out.push((words & 0xff) as u8);
        out.push(((words >> 8) & 0xff) as u8);
        out.push(((words >> 16) & 0xff) as u8);
    }
    out.extend_from_slice(data);
    if odd {
        out.push(0);
    }
}

/// One self-contained block (initial and final) for the given samples.
pub(crate) struct BlockSpec<'a> {
    pub samples: &'a [i32],
    pub mono: bool,
    pub bytes_per_sample: u32,
    pub block_index: u64,
    pub total_samples: Option<u64>,
    pub md5: Option<[u8; 16]>,
    pub with_block_checksum: bool,
    pub term: Option<(i8, u8)>,
}

impl BlockSpec<'_> {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let channels = if self.mono { 1 } else { 2 };
        assert_eq!(self.samples.len() % channels, 0);
        let frames = self.samples.len() / channels;

        let mut crc: u32 = u32::MAX;
        for &sample in self.samples {
            crc = crc.wrapping_mul(3).wrapping_add(sample as u32);
        }

        let mut body = Vec::new();
        if !self.samples.is_empty() {
            let terms: Vec<u8> = self
                .term
                .iter()
                .map(|&(t, d)| ((t as i32 + 5) as u8 & 0x1f) | (d << 5))
                .collect();
            sub_block(&mut body, ID_DECORR_TERMS, &terms);
            let weights = vec![0u8; terms.len() * channels];
            sub_block(&mut body, ID_DECORR_WEIGHTS, &weights);
            if let Some((term, _)) = self.term {
                let per_channel: usize = match term {
                    17 | 18 => 2,
                    t => t as usize,
                };
                sub_block(&mut body, ID_DECORR_SAMPLES, &vec![0u8; per_channel * channels * 2]);
            }
            sub_block(&mut body, ID_ENTROPY_VARS, &vec![0u8; channels * 6]);

            let residuals = match self.term {
                Some((term, delta)) => {
                    forward_decorr(self.samples, self.mono, term, i32::from(delta))
                }
                None => self.samples.to_vec(),
            };
            sub_block(&mut body, ID_WV_BITSTREAM, &encode_residuals(&residuals, self.mono));
        }
        if let Some(md5) = self.md5 {
            sub_block(&mut body, ID_MD5_CHECKSUM, &md5);
        }

        let checksum_bytes = if self.with_block_checksum { 4 } else { 0 };
        let ck_size = (BLOCK_HEADER_SIZE + body.len() + checksum_bytes - 8) as u32;
        let flags = (self.bytes_per_sample - 1)
            | if self.mono { MONO_FLAG } else { 0 }
            | INITIAL_BLOCK
            | FINAL_BLOCK;
        let version: u16 = if self.with_block_checksum { 0x410 } else { 0x406 };
        let (total_hi, total_lo) = match self.total_samples {
            Some(total) => ((total >> 32) as u8, total as u32),
            None => (0xFF, u32::MAX),
        };

        let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + body.len() + checksum_bytes);
        block.extend_from_slice(b"wvpk");
        block.extend_from_slice(&ck_size.to_le_bytes());
        block.extend_from_slice(&version.to_le_bytes());
        block.push((self.block_index >> 32) as u8);
        block.push(total_hi);
        block.extend_from_slice(&total_lo.to_le_bytes());
        block.extend_from_slice(&(self.block_index as u32).to_le_bytes());
        block.extend_from_slice(&(frames as u32).to_le_bytes());
        block.extend_from_slice(&flags.to_le_bytes());
        block.extend_from_slice(&crc.to_le_bytes());
        block.extend_from_slice(&body);

        if self.with_block_checksum {
            block.push(ID_BLOCK_CHECKSUM);
            block.push(1);
            let csum = block_checksum(&[&block]);
            let folded = (csum ^ (csum >> 16)) as u16;
            block.extend_from_slice(&folded.to_le_bytes());
        }
        block
    }
}

/// Digest of serialized samples, as the validator computes it.
pub(crate) fn md5_of(samples: &[i32], bytes_per_sample: u32) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(serialize_samples(samples, bytes_per_sample));
    hasher.finalize().into()
}
