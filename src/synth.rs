//! Synthetic Lighthouse signal.
//!
//! Generates the pulse train two base stations would produce for sensors at
//! known bearings, including sync codes with data bits and the skip/axis
//! schedule. Used to exercise the decoder without hardware.

use core::f32::consts::PI;

use heapless::Vec;

use crate::config::TimingConfig;
use crate::decoder::cycle_sync::SyncCode;
use crate::decoder::data_frame::{calc_crc32, framed_len, PREAMBLE_ZEROS};
use crate::state::{Pulse, MAX_BYTES_IN_DATA_FRAME, MAX_NUM_INPUTS, NUM_BASE_STATIONS, NUM_CYCLE_PHASES};
use crate::time::{TimeDelta, Timestamp};

/// Bits of the longest encodable OOTX frame.
pub const MAX_FRAME_BITS: usize =
    PREAMBLE_ZEROS as usize + 1 + 17 * (RAW_FRAME_LEN / 2);

const RAW_FRAME_LEN: usize = framed_len(MAX_BYTES_IN_DATA_FRAME);

/// Every flash on every sensor plus one sweep per sensor, for two cycles.
const PENDING_CAPACITY: usize = 2 * (NUM_BASE_STATIONS + 1) * MAX_NUM_INPUTS;

/// Default sweep pulse length: 10 µs at 48 MHz.
const SWEEP_LEN_TICKS: i32 = 480;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SynthError {
    PayloadTooLong,
    BufferFull,
}

/// Append the OOTX bit stream for `payload` to `out`.
pub fn encode_ootx_frame<const N: usize>(
    payload: &[u8],
    out: &mut Vec<bool, N>,
) -> Result<(), SynthError> {
    if payload.len() > MAX_BYTES_IN_DATA_FRAME {
        return Err(SynthError::PayloadTooLong);
    }
    let mut raw: Vec<u8, RAW_FRAME_LEN> = Vec::new();
    let len = payload.len() as u16;
    raw.extend_from_slice(&len.to_le_bytes())
        .map_err(|_| SynthError::BufferFull)?;
    raw.extend_from_slice(payload)
        .map_err(|_| SynthError::BufferFull)?;
    if payload.len() % 2 == 1 {
        raw.push(0).map_err(|_| SynthError::BufferFull)?;
    }
    raw.extend_from_slice(&calc_crc32(payload).to_le_bytes())
        .map_err(|_| SynthError::BufferFull)?;

    for _ in 0..PREAMBLE_ZEROS {
        out.push(false).map_err(|_| SynthError::BufferFull)?;
    }
    out.push(true).map_err(|_| SynthError::BufferFull)?;
    for pair in raw.chunks(2) {
        let word = u16::from_be_bytes([pair[0], pair[1]]);
        for i in (0..16).rev() {
            out.push(word & (1 << i) != 0)
                .map_err(|_| SynthError::BufferFull)?;
        }
        out.push(true).map_err(|_| SynthError::BufferFull)?;
    }
    Ok(())
}

struct SimStation {
    enabled: bool,
    /// Flash time within the cycle.
    offset: TimeDelta,
    data: Vec<bool, MAX_FRAME_BITS>,
    data_pos: usize,
}

impl SimStation {
    fn next_data_bit(&mut self) -> bool {
        match self.data.get(self.data_pos) {
            Some(&bit) => {
                self.data_pos += 1;
                bit
            }
            None => false,
        }
    }
}

pub struct LighthouseSimulator {
    timing: TimingConfig,
    num_inputs: usize,
    stations: [SimStation; NUM_BASE_STATIONS],
    /// True bearing of each sensor per phase; `None` when occluded.
    angles: [[Option<f32>; NUM_CYCLE_PHASES]; MAX_NUM_INPUTS],
    cycle: u32,
    cycle_start: Timestamp,
    sweep_len: TimeDelta,
    pending: Vec<Pulse, PENDING_CAPACITY>,
}

impl LighthouseSimulator {
    /// Station 0 flashes at the cycle start, station 1 400 µs later.
    pub fn new(timing: TimingConfig, num_inputs: usize, start: Timestamp) -> Self {
        let station = |offset| SimStation {
            enabled: true,
            offset,
            data: Vec::new(),
            data_pos: 0,
        };
        let slave_offset = TimeDelta(400 * timing.ticks_per_us as i32);
        Self {
            timing,
            num_inputs: num_inputs.min(MAX_NUM_INPUTS),
            stations: [station(TimeDelta::ZERO), station(slave_offset)],
            angles: [[None; NUM_CYCLE_PHASES]; MAX_NUM_INPUTS],
            cycle: 0,
            cycle_start: start,
            sweep_len: TimeDelta(SWEEP_LEN_TICKS * timing.ticks_per_us as i32 / 48),
            pending: Vec::new(),
        }
    }

    pub fn set_station_enabled(&mut self, bs: usize, enabled: bool) {
        if let Some(s) = self.stations.get_mut(bs) {
            s.enabled = enabled;
        }
    }

    pub fn set_station_offset(&mut self, bs: usize, offset: TimeDelta) {
        if let Some(s) = self.stations.get_mut(bs) {
            s.offset = offset;
        }
    }

    /// Bearings of one sensor as `[h0, v0, h1, v1]`.
    pub fn set_sensor_angles(&mut self, input_idx: usize, angles: [Option<f32>; NUM_CYCLE_PHASES]) {
        if let Some(a) = self.angles.get_mut(input_idx) {
            *a = angles;
        }
    }

    /// Start transmitting `payload` on the station's data channel.
    pub fn send_data_frame(&mut self, bs: usize, payload: &[u8]) -> Result<(), SynthError> {
        let s = self.stations.get_mut(bs).ok_or(SynthError::BufferFull)?;
        s.data.clear();
        s.data_pos = 0;
        encode_ootx_frame(payload, &mut s.data)
    }

    /// Start of the next cycle to be generated. Every pulse already returned
    /// starts before it.
    pub fn now(&self) -> Timestamp {
        self.cycle_start
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Generate one cycle. Returns, in start order, all pulses that begin
    /// before the end of that cycle.
    pub fn next_cycle(&mut self) -> Vec<Pulse, PENDING_CAPACITY> {
        let both = self.stations.iter().all(|s| s.enabled);
        let phase = (self.cycle % NUM_CYCLE_PHASES as u32) as usize;
        let (sweeper, axis) = if both {
            (phase / 2, (phase % 2) as u8)
        } else {
            let only = self.stations.iter().position(|s| s.enabled).unwrap_or(0);
            (only, (self.cycle % 2) as u8)
        };

        for bs in 0..NUM_BASE_STATIONS {
            if !self.stations[bs].enabled {
                continue;
            }
            let code = SyncCode {
                axis,
                data: self.stations[bs].next_data_bit(),
                skip: bs != sweeper,
            };
            let flash = self.cycle_start + self.stations[bs].offset;
            let len = code.pulse_len(&self.timing);
            for input in 0..self.num_inputs {
                let _ = self.pending.push(Pulse {
                    input_idx: input as u32,
                    start_time: flash,
                    pulse_len: len,
                });
            }
            if code.skip {
                continue;
            }
            let phase_id = bs * 2 + axis as usize;
            for input in 0..self.num_inputs {
                let Some(angle) = self.angles[input][phase_id] else {
                    continue;
                };
                let offset = self.sweep_offset(angle);
                let _ = self.pending.push(Pulse {
                    input_idx: input as u32,
                    start_time: flash + offset - self.sweep_len.half(),
                    pulse_len: self.sweep_len,
                });
            }
        }

        self.cycle = self.cycle.wrapping_add(1);
        let start = self.cycle_start;
        self.cycle_start += self.timing.cycle_period;
        let end = self.cycle_start;

        self.pending
            .sort_unstable_by_key(|p| (p.start_time.since(start), p.input_idx));
        let mut out = Vec::new();
        let mut rest = Vec::new();
        for p in self.pending.iter() {
            if p.start_time.is_before(end) {
                let _ = out.push(*p);
            } else {
                let _ = rest.push(*p);
            }
        }
        self.pending = rest;
        out
    }

    /// Crossing time after the flash for a sensor at `angle`.
    fn sweep_offset(&self, angle: f32) -> TimeDelta {
        let ticks = angle * self.timing.rotor_period.0 as f32 / (2.0 * PI);
        self.timing.sweep_center_offset + TimeDelta(ticks as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::cycle_sync::{classify_pulse, PulseClass};

    #[test]
    fn frame_bits_have_preamble_and_stuffing() {
        let mut bits: Vec<bool, MAX_FRAME_BITS> = Vec::new();
        encode_ootx_frame(&[0xAB], &mut bits).unwrap();
        // preamble + 1, then length, payload+pad, crc = 4 words of 17 bits.
        assert_eq!(bits.len(), 18 + 4 * 17);
        assert!(bits[..17].iter().all(|b| !b));
        assert!(bits[17]);
        for w in 0..4 {
            assert!(bits[18 + w * 17 + 16], "stuffing bit of word {}", w);
        }
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut bits: Vec<bool, MAX_FRAME_BITS> = Vec::new();
        assert_eq!(
            encode_ootx_frame(&[0; MAX_BYTES_IN_DATA_FRAME + 1], &mut bits),
            Err(SynthError::PayloadTooLong)
        );
        assert!(encode_ootx_frame(&[0; MAX_BYTES_IN_DATA_FRAME], &mut bits).is_ok());
    }

    #[test]
    fn two_station_schedule_sweeps_one_station_per_cycle() {
        let t = TimingConfig::default();
        let mut sim = LighthouseSimulator::new(t, 1, Timestamp(0));
        sim.set_sensor_angles(0, [Some(0.0); 4]);
        for cycle in 0..4u32 {
            let pulses = sim.next_cycle();
            let syncs: std::vec::Vec<_> = pulses
                .iter()
                .filter_map(|p| match classify_pulse(p.pulse_len, &t) {
                    PulseClass::Sync(code) => Some(code),
                    _ => None,
                })
                .collect();
            assert_eq!(syncs.len(), 2);
            let sweeping = cycle as usize / 2;
            assert!(!syncs[sweeping].skip);
            assert!(syncs[1 - sweeping].skip);
            assert_eq!(syncs[sweeping].axis as u32, cycle % 2);
            let sweeps = pulses
                .iter()
                .filter(|p| classify_pulse(p.pulse_len, &t) == PulseClass::Sweep)
                .count();
            assert_eq!(sweeps, 1);
        }
        assert_eq!(sim.now(), Timestamp(4 * 400_000));
    }

    #[test]
    fn pulses_are_returned_in_time_order_across_cycles() {
        let t = TimingConfig::default();
        let mut sim = LighthouseSimulator::new(t, 2, Timestamp(u32::MAX - 500_000));
        sim.set_sensor_angles(0, [Some(0.9); 4]);
        sim.set_sensor_angles(1, [Some(-0.9); 4]);
        sim.set_station_offset(1, TimeDelta(380_000));
        let mut last: Option<Timestamp> = None;
        for _ in 0..8 {
            let before = sim.now();
            for p in sim.next_cycle().iter() {
                if let Some(l) = last {
                    assert!(!p.start_time.is_before(l));
                }
                assert!(p.start_time.is_before(sim.now()));
                assert!(!p.start_time.is_before(before));
                last = Some(p.start_time);
            }
        }
    }

    #[test]
    fn data_bits_follow_the_queued_frame() {
        let t = TimingConfig::default();
        let mut sim = LighthouseSimulator::new(t, 1, Timestamp(0));
        sim.set_station_enabled(1, false);
        sim.send_data_frame(0, &[0x5A]).unwrap();
        let mut expected: Vec<bool, MAX_FRAME_BITS> = Vec::new();
        encode_ootx_frame(&[0x5A], &mut expected).unwrap();
        for &bit in expected.iter() {
            let pulses = sim.next_cycle();
            let PulseClass::Sync(code) = classify_pulse(pulses[0].pulse_len, &t) else {
                panic!("first pulse is not a sync flash");
            };
            assert_eq!(code.data, bit);
        }
        // Idle afterwards.
        let pulses = sim.next_cycle();
        assert!(matches!(
            classify_pulse(pulses[0].pulse_len, &t),
            PulseClass::Sync(SyncCode { data: false, .. })
        ));
    }
}
