//! Sweep pulses → bearing angles.
//!
//! A committed sync flash that does not announce a skip opens a phase
//! (`base_station_idx * 2 + axis`). Sweep pulses arriving while the phase is
//! open are converted to angles from their offset to that flash. The phase
//! closes on the next sweeping tick, on the owner's next tick or miss, or once
//! the sweep window has passed; its snapshot is emitted once, as soon as every
//! sensor has reported or at close time.

use core::f32::consts::PI;

use heapless::Vec;

use crate::config::TimingConfig;
use crate::decoder::cycle_sync::CycleTick;
use crate::state::{
    Pulse, SensorAngles, SensorAnglesFrame, MAX_NUM_INPUTS, NUM_BASE_STATIONS, NUM_CYCLE_PHASES,
};
use crate::time::{TimeDelta, Timestamp};

/// Largest accepted bearing.
pub const MAX_ANGLE: f32 = PI / 3.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExtractorStats {
    pub frames: u32,
    /// Second and later sweeps on one sensor within one phase.
    pub reflections: u32,
    /// Sweeps inside the window whose angle fell outside ±π/3.
    pub out_of_range: u32,
    /// Sweeps with no open phase or outside the sweep window.
    pub stray: u32,
}

#[derive(Clone, Copy, Debug)]
struct OpenPhase {
    base_station_idx: u32,
    phase_id: usize,
    cycle_idx: u32,
    sync_time: Timestamp,
    /// Sensors that already reported in this phase.
    seen: u8,
    emitted: bool,
}

pub struct SensorAngleExtractor {
    timing: TimingConfig,
    num_inputs: usize,
    angles: Vec<SensorAngles, MAX_NUM_INPUTS>,
    phase: Option<OpenPhase>,
    stats: ExtractorStats,
}

impl SensorAngleExtractor {
    pub fn new(timing: TimingConfig, num_inputs: usize) -> Self {
        let num_inputs = num_inputs.min(MAX_NUM_INPUTS);
        let mut angles = Vec::new();
        for _ in 0..num_inputs {
            let _ = angles.push(SensorAngles::default());
        }
        Self {
            timing,
            num_inputs,
            angles,
            phase: None,
            stats: ExtractorStats::default(),
        }
    }

    pub fn angles(&self) -> &[SensorAngles] {
        &self.angles
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    /// Phase currently accepting sweeps.
    pub fn open_phase(&self) -> Option<usize> {
        self.phase.map(|p| p.phase_id)
    }

    fn all_seen_mask(&self) -> u8 {
        ((1u16 << self.num_inputs) - 1) as u8
    }

    /// A sync flash was committed by one of the trackers.
    pub fn on_tick(&mut self, tick: &CycleTick) -> Option<SensorAnglesFrame> {
        let closes = match self.phase {
            Some(p) => !tick.code.skip || p.base_station_idx == tick.base_station_idx,
            None => false,
        };
        let frame = if closes { self.close() } else { None };

        if !tick.code.skip {
            let bs = tick.base_station_idx as usize;
            if bs < NUM_BASE_STATIONS {
                self.phase = Some(OpenPhase {
                    base_station_idx: tick.base_station_idx,
                    phase_id: bs * 2 + (tick.code.axis & 1) as usize,
                    cycle_idx: tick.cycle_idx,
                    sync_time: tick.time,
                    seen: 0,
                    emitted: false,
                });
            }
        }
        frame
    }

    /// The owning station's window closed without a flash.
    pub fn on_missed(&mut self, base_station_idx: u32) -> Option<SensorAnglesFrame> {
        match self.phase {
            Some(p) if p.base_station_idx == base_station_idx => self.close(),
            _ => None,
        }
    }

    /// Close the phase once the sweep window has passed.
    pub fn advance(&mut self, now: Timestamp) -> Option<SensorAnglesFrame> {
        let p = self.phase?;
        let (_, window_end) = self.timing.sweep_window();
        if (p.sync_time + window_end).is_before(now) {
            self.close()
        } else {
            None
        }
    }

    pub fn on_sweep(&mut self, pulse: &Pulse) -> Option<SensorAnglesFrame> {
        let idx = pulse.input_idx as usize;
        let Some(mut p) = self.phase else {
            self.stats.stray = self.stats.stray.wrapping_add(1);
            return None;
        };
        if idx >= self.num_inputs {
            return None;
        }

        let offset = pulse.center().since(p.sync_time);
        let (window_start, window_end) = self.timing.sweep_window();
        if offset < window_start || offset > window_end {
            self.stats.stray = self.stats.stray.wrapping_add(1);
            return None;
        }

        let bit = 1u8 << idx;
        if p.seen & bit != 0 {
            self.stats.reflections = self.stats.reflections.wrapping_add(1);
            return None;
        }

        let Some(angle) = self.angle_from_offset(offset) else {
            self.stats.out_of_range = self.stats.out_of_range.wrapping_add(1);
            return None;
        };
        let sensor = &mut self.angles[idx];
        sensor.angles[p.phase_id] = angle;
        sensor.updated_cycles[p.phase_id] = p.cycle_idx;
        p.seen |= bit;

        let complete = p.seen == self.all_seen_mask() && !p.emitted;
        if complete {
            p.emitted = true;
        }
        self.phase = Some(p);
        if complete {
            Some(self.snapshot(&p))
        } else {
            None
        }
    }

    /// Bearing for a sweep crossing `offset` after its sync flash.
    pub fn angle_from_offset(&self, offset: TimeDelta) -> Option<f32> {
        let rel = (offset - self.timing.sweep_center_offset).0 as f32;
        let angle = rel * 2.0 * PI / self.timing.rotor_period.0 as f32;
        if (-MAX_ANGLE..=MAX_ANGLE).contains(&angle) {
            Some(angle)
        } else {
            None
        }
    }

    /// Forget every angle measured from `base_station_idx`.
    pub fn invalidate_station(&mut self, base_station_idx: u32) {
        let bs = base_station_idx as usize;
        if bs >= NUM_BASE_STATIONS {
            return;
        }
        for s in self.angles.iter_mut() {
            s.invalidate(bs * 2);
            s.invalidate(bs * 2 + 1);
        }
        if self.phase.is_some_and(|p| p.base_station_idx == base_station_idx) {
            self.phase = None;
        }
    }

    /// Exchange the angles of the two station slots.
    pub fn swap_stations(&mut self) {
        for s in self.angles.iter_mut() {
            s.angles.swap(0, 2);
            s.angles.swap(1, 3);
            s.updated_cycles.swap(0, 2);
            s.updated_cycles.swap(1, 3);
        }
        self.phase = None;
    }

    /// Forget all angles, the open phase and the counters.
    pub fn reset(&mut self) {
        for s in self.angles.iter_mut() {
            *s = SensorAngles::default();
        }
        self.phase = None;
        self.stats = ExtractorStats::default();
    }

    fn close(&mut self) -> Option<SensorAnglesFrame> {
        let p = self.phase.take()?;
        if p.emitted {
            None
        } else {
            Some(self.snapshot(&p))
        }
    }

    fn snapshot(&mut self, p: &OpenPhase) -> SensorAnglesFrame {
        debug_assert!(p.phase_id < NUM_CYCLE_PHASES);
        self.stats.frames = self.stats.frames.wrapping_add(1);
        SensorAnglesFrame {
            time: p.sync_time,
            cycle_idx: p.cycle_idx,
            phase_id: p.phase_id as i32,
            sensors: self.angles.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::cycle_sync::SyncCode;

    fn extractor(n: usize) -> SensorAngleExtractor {
        SensorAngleExtractor::new(TimingConfig::default(), n)
    }

    fn tick(bs: u32, cycle: u32, t: u32, axis: u8, skip: bool) -> CycleTick {
        let code = SyncCode {
            axis,
            data: false,
            skip,
        };
        CycleTick {
            base_station_idx: bs,
            cycle_idx: cycle,
            time: Timestamp(t),
            pulse_len: code.pulse_len(&TimingConfig::default()),
            code,
        }
    }

    /// Sweep pulse whose center sits `offset` ticks after `sync`.
    fn sweep(input: u32, sync: u32, offset: i32) -> Pulse {
        let len = 200;
        Pulse {
            input_idx: input,
            start_time: Timestamp((sync as i64 + offset as i64 - len as i64 / 2) as u32),
            pulse_len: TimeDelta(len),
        }
    }

    const CENTER: i32 = 192_000;

    #[test]
    fn centered_sweep_reads_zero() {
        let mut ex = extractor(1);
        assert!(ex.on_tick(&tick(0, 5, 1_000, 0, false)).is_none());
        let frame = ex.on_sweep(&sweep(0, 1_000, CENTER)).unwrap();
        assert_eq!(frame.phase_id, 0);
        assert_eq!(frame.cycle_idx, 5);
        assert_eq!(frame.time, Timestamp(1_000));
        assert!(frame.sensors[0].angles[0].abs() < 1e-6);
        assert_eq!(frame.sensors[0].updated_cycles[0], 5);
    }

    #[test]
    fn angle_scales_with_rotor_period() {
        let ex = extractor(1);
        // A quarter of a rotor revolution is π/2, out of range; a twelfth is π/6.
        let twelfth = TimeDelta(CENTER + 800_000 / 12);
        let a = ex.angle_from_offset(twelfth).unwrap();
        assert!((a - PI / 6.0).abs() < 1e-4);
        assert_eq!(ex.angle_from_offset(TimeDelta(CENTER + 200_000)), None);
    }

    #[test]
    fn phase_id_combines_station_and_axis() {
        let mut ex = extractor(2);
        ex.on_tick(&tick(1, 0, 0, 1, false));
        assert_eq!(ex.open_phase(), Some(3));
        ex.on_tick(&tick(0, 0, 400_000, 0, false));
        assert_eq!(ex.open_phase(), Some(0));
    }

    #[test]
    fn skip_tick_of_other_station_keeps_phase_open() {
        let mut ex = extractor(2);
        ex.on_tick(&tick(0, 0, 0, 1, false));
        assert!(ex.on_tick(&tick(1, 0, 19_200, 0, true)).is_none());
        assert_eq!(ex.open_phase(), Some(1));
        ex.on_sweep(&sweep(0, 0, CENTER + 1_000));
        // Partial phase is flushed by the next sweeping tick.
        let frame = ex.on_tick(&tick(1, 1, 400_000, 0, false)).unwrap();
        assert_eq!(frame.phase_id, 1);
        assert_eq!(frame.sensors[0].updated_cycles[1], 0);
        assert_eq!(frame.sensors[1].updated_cycles[1], u32::MAX);
    }

    #[test]
    fn first_sweep_wins_and_reflections_are_counted() {
        let mut ex = extractor(2);
        ex.on_tick(&tick(0, 2, 0, 0, false));
        ex.on_sweep(&sweep(0, 0, CENTER + 5_000));
        ex.on_sweep(&sweep(0, 0, CENTER - 9_000));
        let a = ex.angles()[0].angles[0];
        assert!(a > 0.0);
        assert_eq!(ex.stats().reflections, 1);
    }

    #[test]
    fn frame_is_emitted_once() {
        let mut ex = extractor(2);
        ex.on_tick(&tick(0, 0, 0, 0, false));
        assert!(ex.on_sweep(&sweep(0, 0, CENTER)).is_none());
        assert!(ex.on_sweep(&sweep(1, 0, CENTER + 10)).is_some());
        // Already emitted: closing the phase does not repeat it.
        assert!(ex.advance(Timestamp(399_000)).is_none());
        assert_eq!(ex.open_phase(), None);
        assert_eq!(ex.stats().frames, 1);
    }

    #[test]
    fn sweep_window_end_closes_phase() {
        let mut ex = extractor(2);
        ex.on_tick(&tick(0, 0, 0, 0, false));
        ex.on_sweep(&sweep(0, 0, CENTER));
        let (_, end) = TimingConfig::default().sweep_window();
        assert!(ex.advance(Timestamp(end.0 as u32)).is_none());
        let frame = ex.advance(Timestamp(end.0 as u32 + 1)).unwrap();
        assert_eq!(frame.phase_id, 0);
    }

    #[test]
    fn miss_of_owner_closes_phase() {
        let mut ex = extractor(1);
        ex.on_tick(&tick(1, 0, 0, 0, false));
        assert!(ex.on_missed(0).is_none());
        assert!(ex.on_missed(1).is_some());
        assert_eq!(ex.open_phase(), None);
    }

    #[test]
    fn sweeps_without_phase_or_outside_window_are_stray() {
        let mut ex = extractor(1);
        ex.on_sweep(&sweep(0, 0, CENTER));
        ex.on_tick(&tick(0, 0, 0, 0, false));
        ex.on_sweep(&sweep(0, 0, 10_000));
        assert_eq!(ex.stats().stray, 2);
        assert_eq!(ex.angles()[0].updated_cycles[0], u32::MAX);
    }

    #[test]
    fn invalidate_and_swap_move_station_slots() {
        let mut ex = extractor(1);
        ex.on_tick(&tick(0, 3, 0, 1, false));
        ex.on_sweep(&sweep(0, 0, CENTER));
        ex.swap_stations();
        assert_eq!(ex.angles()[0].updated_cycles[3], 3);
        assert_eq!(ex.angles()[0].updated_cycles[1], u32::MAX);
        ex.invalidate_station(1);
        assert_eq!(ex.angles()[0].updated_cycles[3], u32::MAX);
    }
}
