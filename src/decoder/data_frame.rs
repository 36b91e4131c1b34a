//! Base-station data channel (OOTX framing).
//!
//! Each committed sync flash carries one bit. A frame is:
//!
//! ```text
//! 0 × 17+ , 1                         preamble
//! [16 bits MSB first, 1] × n          words, each followed by a stuffing 1
//!   word 0         payload length, little endian
//!   words 1..      payload, padded to an even byte count
//!   last 2 words   CRC-32 of the payload, little endian
//! ```
//!
//! Any inconsistency discards the partial frame and restarts the hunt for a
//! preamble; nothing incomplete is ever emitted.

use heapless::Vec;

use crate::state::{DataFrame, DataFrameBit, MAX_BYTES_IN_DATA_FRAME};
use crate::time::Timestamp;

/// Zero bits that announce a frame.
pub const PREAMBLE_ZEROS: u32 = 17;
const WORD_BITS: u8 = 16;
const LEN_BYTES: usize = 2;
const CRC_BYTES: usize = 4;
const RAW_CAPACITY: usize = LEN_BYTES + MAX_BYTES_IN_DATA_FRAME + CRC_BYTES;

/// CRC-32 (IEEE 802.3, reflected, as used by zlib).
pub fn calc_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            if (crc & 1) != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Bytes on the wire for a payload of `len` bytes, header and CRC included.
pub const fn framed_len(len: usize) -> usize {
    LEN_BYTES + len + (len & 1) + CRC_BYTES
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataFrameStats {
    pub frames: u32,
    pub crc_errors: u32,
    /// Stuffing bit was 0, or a preamble interrupted a frame.
    pub framing_errors: u32,
    /// Length header above `MAX_BYTES_IN_DATA_FRAME`.
    pub oversized: u32,
    /// Partial frames dropped on a cycle gap or loss of sync.
    pub aborted: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Hunting,
    Receiving,
}

pub struct DataFrameDecoder {
    base_station_idx: u32,
    stage: Stage,
    zeros: u32,
    last_cycle: Option<u32>,
    word: u16,
    word_bits: u8,
    /// Next bit is a stuffing bit.
    stuffing: bool,
    raw: Vec<u8, RAW_CAPACITY>,
    expected_raw: usize,
    stats: DataFrameStats,
}

impl DataFrameDecoder {
    pub fn new(base_station_idx: u32) -> Self {
        Self {
            base_station_idx,
            stage: Stage::Hunting,
            zeros: 0,
            last_cycle: None,
            word: 0,
            word_bits: 0,
            stuffing: false,
            raw: Vec::new(),
            expected_raw: 0,
            stats: DataFrameStats::default(),
        }
    }

    pub fn base_station_idx(&self) -> u32 {
        self.base_station_idx
    }

    pub fn set_base_station_idx(&mut self, idx: u32) {
        self.base_station_idx = idx;
    }

    pub fn stats(&self) -> DataFrameStats {
        self.stats
    }

    pub fn is_receiving(&self) -> bool {
        self.stage == Stage::Receiving
    }

    /// Drop any partial frame; called when the station leaves `Synced`.
    pub fn reset(&mut self) {
        if self.stage == Stage::Receiving {
            self.stats.aborted = self.stats.aborted.wrapping_add(1);
            log_debug!("bs{} data frame aborted", self.base_station_idx);
        }
        self.hunt();
        self.zeros = 0;
        self.last_cycle = None;
    }

    fn hunt(&mut self) {
        self.stage = Stage::Hunting;
        self.word = 0;
        self.word_bits = 0;
        self.stuffing = false;
        self.raw.clear();
        self.expected_raw = 0;
    }

    pub fn push_bit(&mut self, bit: &DataFrameBit) -> Option<DataFrame> {
        if let Some(last) = self.last_cycle {
            if bit.cycle_idx != last.wrapping_add(1) {
                self.reset();
            }
        }
        self.last_cycle = Some(bit.cycle_idx);

        let preamble_seen = self.zeros >= PREAMBLE_ZEROS;
        self.zeros = if bit.bit { 0 } else { self.zeros.saturating_add(1) };

        match self.stage {
            Stage::Hunting => {
                if bit.bit && preamble_seen {
                    self.hunt();
                    self.stage = Stage::Receiving;
                }
                None
            }
            Stage::Receiving => {
                if self.zeros >= PREAMBLE_ZEROS {
                    self.stats.framing_errors = self.stats.framing_errors.wrapping_add(1);
                    self.hunt();
                    return None;
                }
                self.receive(bit.bit, bit.time)
            }
        }
    }

    fn receive(&mut self, bit: bool, time: Timestamp) -> Option<DataFrame> {
        if self.stuffing {
            self.stuffing = false;
            if !bit {
                self.stats.framing_errors = self.stats.framing_errors.wrapping_add(1);
                log_debug!("bs{} data frame stuffing error", self.base_station_idx);
                self.hunt();
            }
            return None;
        }

        self.word = (self.word << 1) | bit as u16;
        self.word_bits += 1;
        if self.word_bits < WORD_BITS {
            return None;
        }

        let [hi, lo] = self.word.to_be_bytes();
        self.word = 0;
        self.word_bits = 0;
        self.stuffing = true;
        let _ = self.raw.push(hi);
        let _ = self.raw.push(lo);

        if self.raw.len() == LEN_BYTES {
            let len = u16::from_le_bytes([hi, lo]) as usize;
            if len > MAX_BYTES_IN_DATA_FRAME {
                self.stats.oversized = self.stats.oversized.wrapping_add(1);
                log_debug!("bs{} data frame too long: {}", self.base_station_idx, len);
                self.hunt();
                return None;
            }
            self.expected_raw = framed_len(len);
            return None;
        }

        if self.raw.len() < self.expected_raw {
            return None;
        }
        let frame = self.finish(time);
        self.hunt();
        frame
    }

    fn finish(&mut self, time: Timestamp) -> Option<DataFrame> {
        let len = u16::from_le_bytes([self.raw[0], self.raw[1]]) as usize;
        let payload = &self.raw[LEN_BYTES..LEN_BYTES + len];
        let crc_at = self.expected_raw - CRC_BYTES;
        let received = u32::from_le_bytes([
            self.raw[crc_at],
            self.raw[crc_at + 1],
            self.raw[crc_at + 2],
            self.raw[crc_at + 3],
        ]);

        if calc_crc32(payload) != received {
            self.stats.crc_errors = self.stats.crc_errors.wrapping_add(1);
            log_warn!("bs{} data frame crc mismatch", self.base_station_idx);
            return None;
        }

        let mut bytes = Vec::new();
        let _ = bytes.extend_from_slice(payload);
        self.stats.frames = self.stats.frames.wrapping_add(1);
        log_info!("bs{} data frame: {} bytes", self.base_station_idx, len);
        Some(DataFrame {
            time,
            base_station_idx: self.base_station_idx,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::encode_ootx_frame;

    fn bits_for(payload: &[u8]) -> std::vec::Vec<bool> {
        let mut out = heapless::Vec::<bool, 1600>::new();
        encode_ootx_frame(payload, &mut out).unwrap();
        out.iter().copied().collect()
    }

    fn feed(dec: &mut DataFrameDecoder, bits: &[bool], first_cycle: u32) -> std::vec::Vec<DataFrame> {
        bits.iter()
            .enumerate()
            .filter_map(|(i, &b)| {
                dec.push_bit(&DataFrameBit {
                    time: Timestamp(i as u32 * 400_000),
                    base_station_idx: 0,
                    cycle_idx: first_cycle + i as u32,
                    bit: b,
                })
            })
            .collect()
    }

    #[test]
    fn crc32_matches_reference_vector() {
        assert_eq!(calc_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(calc_crc32(&[]), 0);
    }

    #[test]
    fn decodes_a_framed_payload() {
        let payload = [0x11u8, 0x22, 0x33, 0x44, 0x55];
        let mut dec = DataFrameDecoder::new(0);
        let frames = feed(&mut dec, &bits_for(&payload), 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].bytes[..], &payload[..]);
        assert_eq!(dec.stats().frames, 1);
        assert!(!dec.is_receiving());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut bits = bits_for(b"abcd");
        bits.extend(bits_for(b"xyz"));
        let mut dec = DataFrameDecoder::new(1);
        let frames = feed(&mut dec, &bits, 100);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].bytes[..], b"abcd");
        assert_eq!(&frames[1].bytes[..], b"xyz");
        assert_eq!(frames[1].base_station_idx, 1);
    }

    #[test]
    fn flipped_payload_bit_fails_crc() {
        let mut bits = bits_for(&[1, 2, 3, 4]);
        // Preamble (18 bits) + length word (17 bits) lands in the payload.
        bits[18 + 17 + 3] = !bits[18 + 17 + 3];
        let mut dec = DataFrameDecoder::new(0);
        assert!(feed(&mut dec, &bits, 0).is_empty());
        assert_eq!(dec.stats().crc_errors, 1);
    }

    #[test]
    fn broken_stuffing_bit_discards_frame() {
        let mut bits = bits_for(&[9, 9]);
        bits[18 + 16] = false;
        let mut dec = DataFrameDecoder::new(0);
        assert!(feed(&mut dec, &bits, 0).is_empty());
        assert_eq!(dec.stats().framing_errors, 1);
    }

    #[test]
    fn cycle_gap_discards_partial_frame() {
        let bits = bits_for(&[7; 10]);
        let mut dec = DataFrameDecoder::new(0);
        let half = bits.len() / 2;
        assert!(feed(&mut dec, &bits[..half], 0).is_empty());
        assert!(dec.is_receiving());
        // Skips one cycle.
        assert!(feed(&mut dec, &bits[half..], half as u32 + 1).is_empty());
        assert_eq!(dec.stats().aborted, 1);
        assert_eq!(dec.stats().frames, 0);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let bits = bits_for(&[1; 6]);
        let mut dec = DataFrameDecoder::new(0);
        feed(&mut dec, &bits[..40], 0);
        dec.reset();
        assert_eq!(dec.stats().aborted, 1);
        assert!(feed(&mut dec, &bits[40..], 40).is_empty());
        // A whole frame afterwards still decodes.
        assert_eq!(feed(&mut dec, &bits, 1_000).len(), 1);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut bits = std::vec::Vec::new();
        bits.extend(core::iter::repeat(false).take(17));
        bits.push(true);
        // Length 0x0100 little endian: bytes [0x00, 0x01].
        let word: u16 = 0x0001;
        for i in (0..16).rev() {
            bits.push(word & (1 << i) != 0);
        }
        bits.push(true);
        let mut dec = DataFrameDecoder::new(0);
        assert!(feed(&mut dec, &bits, 0).is_empty());
        assert_eq!(dec.stats().oversized, 1);
        assert!(!dec.is_receiving());
    }
}
