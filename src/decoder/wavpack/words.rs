//! WavPack residual entropy coding.
//!
//! Residuals are coded against three adaptive medians per channel: the
//! median bucket is sent as a modified unary count whose parity pre-announces
//! whether the next bucket is zero (so one code can absorb its neighbor's
//! delimiter), the position inside the bucket as a truncated binary code,
//! and the sign last. Runs of zero samples collapse into an Elias-gamma
//! count once the medians decay below two.

/// Maximum consecutive ones in a bucket code before the escape.
pub(crate) const LIMIT_ONES: u32 = 16;

const DIV: [u32; 3] = [128, 64, 32];

pub(crate) fn get_med(medians: &[u32; 3], n: usize) -> u32 {
    (medians[n] >> 4) + 1
}

pub(crate) fn inc_med(medians: &mut [u32; 3], n: usize) {
    medians[n] += (medians[n] + DIV[n]) / DIV[n] * 5;
}

pub(crate) fn dec_med(medians: &mut [u32; 3], n: usize) {
    medians[n] = medians[n].saturating_sub((medians[n] + DIV[n] - 2) / DIV[n] * 2);
}

/// log2 lookup expansion used for the stored entropy medians and
/// decorrelation history samples.
pub(crate) fn wp_exp2s(log: i32) -> i32 {
    if log < 0 {
        return -wp_exp2s(-log);
    }
    let value = exp2_byte((log & 0xff) as u8) | 0x100;
    let log = log >> 8;
    if log <= 9 {
        (value >> (9 - log)) as i32
    } else {
        (value as i64) .checked_shl((log - 9) as u32)
            .map(|v| v as i32)
            .unwrap_or(i32::MAX)
    }
}

fn exp2_byte(i: u8) -> u32 {
    ((f64::from(i) / 256.0).exp2() * 256.0 - 256.0).round() as u32
}

/// LSB-first bit reader over one block's bitstream sub-block.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u32,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        BitReader { data, byte: 0, bit: 0 }
    }

    pub(crate) fn get_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.byte)?;
        let bit = (u32::from(byte) >> self.bit) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.byte += 1;
        }
        Some(bit)
    }

    pub(crate) fn get_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for i in 0..count {
            value |= self.get_bit()? << i;
        }
        Some(value)
    }
}

/// Per-block residual decoder state.
pub(crate) struct WordsDecoder<'a> {
    pub(crate) bits: BitReader<'a>,
    pub(crate) medians: [[u32; 3]; 2],
    holding_one: bool,
    holding_zero: bool,
    zeros_acc: u32,
}

impl<'a> WordsDecoder<'a> {
    pub(crate) fn new(bits: BitReader<'a>, medians: [[u32; 3]; 2]) -> Self {
        WordsDecoder { bits, medians, holding_one: false, holding_zero: false, zeros_acc: 0 }
    }

    /// Elias-gamma-style count: unary bit length, then the low bits
    /// LSB-first under an implicit top bit.
    fn read_egc(&mut self) -> Option<u32> {
        let mut cbits = 0u32;
        while cbits < 33 && self.bits.get_bit()? == 1 {
            cbits += 1;
        }
        if cbits == 33 {
            return None;
        }
        if cbits < 2 {
            return Some(cbits);
        }
        let mut value = self.bits.get_bits(cbits - 1)?;
        value |= 1 << (cbits - 1);
        Some(value)
    }

    /// The modified unary bucket count. A pending held zero yields bucket
    /// zero without touching the bitstream; otherwise the raw count is
    /// halved, with its parity latching the holding state for the next
    /// code.
    fn read_bucket(&mut self) -> Option<u32> {
        if self.holding_zero {
            self.holding_zero = false;
            return Some(0);
        }
        let mut raw = 0u32;
        while raw < LIMIT_ONES + 1 && self.bits.get_bit()? == 1 {
            raw += 1;
        }
        if raw == LIMIT_ONES + 1 {
            return None;
        }
        if raw == LIMIT_ONES {
            raw = LIMIT_ONES + self.read_egc()?;
        }
        let count = if self.holding_one { (raw >> 1) + 1 } else { raw >> 1 };
        self.holding_one = raw & 1 != 0;
        self.holding_zero = !self.holding_one;
        Some(count)
    }

    /// Truncated binary code in `0..=maxcode`.
    fn read_code(&mut self, maxcode: u32) -> Option<u32> {
        let bitcount = 32 - maxcode.leading_zeros();
        if bitcount == 0 {
            return Some(0);
        }
        let extras = ((1u64 << bitcount) - u64::from(maxcode) - 1) as u32;
        let mut code = self.bits.get_bits(bitcount - 1)?;
        if code >= extras {
            code = (code << 1) - extras + self.bits.get_bit()?;
        }
        Some(code)
    }

    /// Decodes the next residual for `channel` (0 or 1; always 0 in mono).
    pub(crate) fn get_sample(&mut self, channel: usize, mono: bool) -> Option<i32> {
        if self.medians[0][0] < 2
            && (mono || self.medians[1][0] < 2)
            && !self.holding_one
            && !self.holding_zero
        {
            if self.zeros_acc > 0 {
                self.zeros_acc -= 1;
                if self.zeros_acc > 0 {
                    return Some(0);
                }
            } else {
                let run = self.read_egc()?;
                if run > 0 {
                    self.zeros_acc = run;
                    self.medians = [[0; 3]; 2];
                    return Some(0);
                }
            }
        }

        let bucket = self.read_bucket()?;
        let medians = &mut self.medians[channel];
        let (low, maxcode) = match bucket {
            0 => {
                let maxcode = get_med(medians, 0) - 1;
                dec_med(medians, 0);
                (0, maxcode)
            }
            1 => {
                let low = get_med(medians, 0);
                let maxcode = get_med(medians, 1) - 1;
                inc_med(medians, 0);
                dec_med(medians, 1);
                (low, maxcode)
            }
            2 => {
                let low = get_med(medians, 0) + get_med(medians, 1);
                let maxcode = get_med(medians, 2) - 1;
                inc_med(medians, 0);
                inc_med(medians, 1);
                dec_med(medians, 2);
                (low, maxcode)
            }
            n => {
                let step = get_med(medians, 2);
                let low = (get_med(medians, 0) + get_med(medians, 1))
                    .wrapping_add((n - 2).wrapping_mul(step));
                inc_med(medians, 0);
                inc_med(medians, 1);
                inc_med(medians, 2);
                (low, step - 1)
            }
        };
        let value = low.wrapping_add(self.read_code(maxcode)?);
        let sign = self.bits.get_bit()?;
        Some(if sign == 1 { !(value as i32) } else { value as i32 })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testenc::{encode_residuals, BitWriter};
    use super::*;

    fn roundtrip(residuals: &[i32], mono: bool) {
        let bytes = encode_residuals(residuals, mono);
        let mut decoder = WordsDecoder::new(BitReader::new(&bytes), [[0; 3]; 2]);
        let channels = if mono { 1 } else { 2 };
        for (i, &expected) in residuals.iter().enumerate() {
            let got = decoder.get_sample(i % channels, mono);
            assert_eq!(got, Some(expected), "sample {i} of {residuals:?}");
        }
    }

    #[test]
    fn bit_reader_is_lsb_first() {
        let mut bits = BitReader::new(&[0b1010_0110, 0xFF]);
        assert_eq!(bits.get_bits(4), Some(0b0110));
        assert_eq!(bits.get_bit(), Some(0));
        assert_eq!(bits.get_bits(5), Some(0b11101));
        assert_eq!(bits.get_bits(6), Some(0b111111));
        assert_eq!(bits.get_bit(), None);
    }

    #[test]
    fn exhausted_stream_is_an_error() {
        let mut decoder = WordsDecoder::new(BitReader::new(&[]), [[99; 3]; 2]);
        assert_eq!(decoder.get_sample(0, true), None);
    }

    #[test]
    fn exp2_fixed_point_anchors() {
        // The stored log is 8.8 fixed point with the integer part holding
        // the bit length, so log 0x100 maps to 1 and each 0x100 doubles.
        assert_eq!(wp_exp2s(0), 0);
        assert_eq!(wp_exp2s(0x100), 1);
        assert_eq!(wp_exp2s(0x200), 2);
        assert_eq!(wp_exp2s(0x700), 64);
        assert_eq!(wp_exp2s(-0x100), -1);
    }

    #[test]
    fn small_residuals_roundtrip() {
        roundtrip(&[0, 1, -1, 2, -2, 3, -3, 0, 0, 1], true);
        roundtrip(&[5, -4, 3, -2, 1, 0, -1, 2, -3, 4, -5, 6], false);
    }

    #[test]
    fn zero_runs_roundtrip() {
        roundtrip(&[0; 40], true);
        let mut mixed = vec![0i32; 17];
        mixed.push(7);
        mixed.extend([0; 9]);
        mixed.push(-7);
        mixed.extend([0; 3]);
        roundtrip(&mixed, true);
        // Stereo run with both channels silent, then a burst.
        let mut stereo = vec![0i32; 24];
        stereo.extend([12, -12, 11, -11]);
        roundtrip(&stereo, false);
    }

    #[test]
    fn large_residuals_take_the_escape() {
        roundtrip(&[40_000, -40_000, 123_456, -1, 0, 65_535], true);
        roundtrip(&[1_000_000, -1_000_000], false);
    }

    #[test]
    fn adaptive_medians_roundtrip() {
        // A long alternating pattern drives the medians up and down.
        let mut data = Vec::new();
        for i in 0..200i32 {
            data.push((i % 17) * if i % 2 == 0 { 1 } else { -1 });
        }
        roundtrip(&data, true);
        roundtrip(&data, false);
    }

    #[test]
    fn bit_writer_mirrors_reader() {
        let mut writer = BitWriter::new();
        writer.put_bits(0b0110, 4);
        writer.put_bit(0);
        writer.put_bits(0b11101, 5);
        let bytes = writer.finish();
        let mut bits = BitReader::new(&bytes);
        assert_eq!(bits.get_bits(4), Some(0b0110));
        assert_eq!(bits.get_bit(), Some(0));
        assert_eq!(bits.get_bits(5), Some(0b11101));
    }
}
