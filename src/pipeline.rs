//! Main-loop orchestration.
//!
//! Drains the per-sensor pulse buffers in time order and pushes every pulse
//! through sync tracking, angle extraction, data decoding and pose solving.
//! Results leave through a [`PipelineSink`].

use heapless::Vec;

use crate::config::{ConfigError, PipelineConfig};
use crate::decoder::angles::{ExtractorStats, SensorAngleExtractor};
use crate::decoder::cycle_sync::{
    classify_pulse, CycleSyncTracker, Offer, PulseClass, SyncState, SyncUpdate, TrackerStats,
};
use crate::decoder::data_frame::{DataFrameDecoder, DataFrameStats};
use crate::decoder::fix_solver::{FixSolver, StationView};
use crate::decoder::pulse_buffer::PulseConsumer;
use crate::state::{
    DataFrame, DataFrameBit, FixLevel, ObjectPosition, Pulse, SensorAnglesFrame, MAX_NUM_INPUTS,
    NUM_BASE_STATIONS,
};
use crate::time::Timestamp;

/// Receives everything the pipeline produces. All methods default to no-ops.
pub trait PipelineSink {
    fn on_angles(&mut self, _frame: &SensorAnglesFrame) {}
    fn on_position(&mut self, _position: &ObjectPosition) {}
    fn on_data_frame(&mut self, _frame: &DataFrame) {}
}

impl PipelineSink for () {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipelineStats {
    pub pulses: u32,
    /// Lost to full pulse buffers.
    pub dropped: u32,
    /// Too short, too long, or from an unknown input.
    pub noise: u32,
    /// Copies of a sync flash already seen on another sensor.
    pub merged_syncs: u32,
    /// Sync flashes no station claimed.
    pub unclaimed_syncs: u32,
    pub slot_swaps: u32,
    pub trackers: [TrackerStats; NUM_BASE_STATIONS],
    pub data: [DataFrameStats; NUM_BASE_STATIONS],
    pub angles: ExtractorStats,
}

struct StationSlot {
    tracker: CycleSyncTracker,
    decoder: DataFrameDecoder,
}

impl StationSlot {
    fn new(idx: u32, config: &PipelineConfig) -> Self {
        Self {
            tracker: CycleSyncTracker::new(idx, config.timing),
            decoder: DataFrameDecoder::new(idx),
        }
    }

    fn set_idx(&mut self, idx: u32) {
        self.tracker.set_base_station_idx(idx);
        self.decoder.set_base_station_idx(idx);
    }

    fn view(&self) -> StationView {
        StationView {
            fix_level: self.tracker.fix_level(),
            cycle_idx: self.tracker.is_synced().then(|| self.tracker.cycle_idx()),
        }
    }
}

pub struct PipelineCoordinator<'a> {
    config: PipelineConfig,
    inputs: Vec<PulseConsumer<'a>, MAX_NUM_INPUTS>,
    slots: [StationSlot; NUM_BASE_STATIONS],
    extractor: SensorAngleExtractor,
    solver: FixSolver,
    /// Start of the most recent sync flash, for merging copies across sensors.
    last_flash: Option<Timestamp>,
    last_dropped: u32,
    stats: PipelineStats,
}

impl<'a> PipelineCoordinator<'a> {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            slots: [StationSlot::new(0, &config), StationSlot::new(1, &config)],
            extractor: SensorAngleExtractor::new(config.timing, config.num_inputs),
            solver: FixSolver::new(config.geometry.clone(), config.timing.max_angle_age_cycles),
            inputs: Vec::new(),
            last_flash: None,
            last_dropped: 0,
            stats: PipelineStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register the consumer half of one sensor's pulse buffer.
    pub fn attach_input(&mut self, input: PulseConsumer<'a>) -> Result<(), ConfigError> {
        if self.inputs.len() >= self.config.num_inputs {
            return Err(ConfigError::TooManyInputs);
        }
        self.inputs
            .push(input)
            .map_err(|_| ConfigError::TooManyInputs)
    }

    /// Process buffered pulses oldest first, then advance the clock.
    ///
    /// A pulse reaches its buffer only once it has ended, so anything that
    /// started within `max_input_pulse_len` of `now` may still be in flight on
    /// another sensor. Both pulse processing and window closing stop at that
    /// horizon; later pulses wait for the next tick.
    pub fn tick(&mut self, now: Timestamp, sink: &mut impl PipelineSink) {
        let horizon = now - self.config.timing.max_input_pulse_len;
        let budget: usize = self.inputs.iter().map(|i| i.len()).sum();
        for _ in 0..budget {
            let Some(pulse) = self.pop_oldest(horizon) else {
                break;
            };
            self.process_pulse(&pulse, sink);
        }
        self.advance_time(horizon, sink);

        let dropped = self.inputs.iter().map(|i| i.dropped()).sum::<u32>();
        if dropped != self.last_dropped {
            log_warn!("pulse buffers overflowed: {} dropped", dropped.wrapping_sub(self.last_dropped));
            self.last_dropped = dropped;
        }
    }

    /// Oldest buffered pulse that started no later than `horizon`.
    fn pop_oldest(&mut self, horizon: Timestamp) -> Option<Pulse> {
        let (idx, age) = self
            .inputs
            .iter()
            .enumerate()
            .filter_map(|(i, input)| input.peek().map(|p| (i, horizon.since(p.start_time))))
            .max_by_key(|(_, age)| *age)?;
        if age.0 < 0 {
            return None;
        }
        self.inputs[idx].pop()
    }

    /// Feed one pulse. Pulses must arrive in start-time order.
    pub fn process_pulse(&mut self, pulse: &Pulse, sink: &mut impl PipelineSink) {
        self.stats.pulses = self.stats.pulses.wrapping_add(1);
        self.advance_time(pulse.start_time, sink);

        if pulse.input_idx as usize >= self.config.num_inputs {
            self.stats.noise = self.stats.noise.wrapping_add(1);
            return;
        }

        match classify_pulse(pulse.pulse_len, &self.config.timing) {
            PulseClass::Sync(_) if self.config.is_sync_input(pulse.input_idx) => {
                self.offer_sync(pulse)
            }
            PulseClass::Sync(_) => {}
            PulseClass::Sweep => {
                if let Some(frame) = self.extractor.on_sweep(pulse) {
                    self.emit_angles(&frame, sink);
                }
            }
            PulseClass::Noise => self.stats.noise = self.stats.noise.wrapping_add(1),
        }
    }

    /// Close every window and phase that ended before `now`.
    pub fn advance_time(&mut self, now: Timestamp, sink: &mut impl PipelineSink) {
        for slot in self.slots.iter_mut().filter(|s| !s.tracker.is_synced()) {
            let _ = slot.tracker.poll(now);
        }

        // Windows close in time order across stations.
        loop {
            let next = (0..NUM_BASE_STATIONS)
                .filter(|&bs| self.slots[bs].tracker.is_synced())
                .max_by_key(|&bs| now.since(self.slots[bs].tracker.expected_sync()));
            let Some(bs) = next else {
                break;
            };
            let Some(update) = self.slots[bs].tracker.poll(now) else {
                break;
            };
            self.handle_update(bs, update, sink);
        }

        if let Some(frame) = self.extractor.advance(now) {
            self.emit_angles(&frame, sink);
        }
    }

    fn handle_update(&mut self, bs: usize, update: SyncUpdate, sink: &mut impl PipelineSink) {
        match update {
            SyncUpdate::Tick(tick) => {
                let bit = DataFrameBit {
                    time: tick.time,
                    base_station_idx: tick.base_station_idx,
                    cycle_idx: tick.cycle_idx,
                    bit: tick.code.data,
                };
                if let Some(frame) = self.slots[bs].decoder.push_bit(&bit) {
                    sink.on_data_frame(&frame);
                }
                if let Some(frame) = self.extractor.on_tick(&tick) {
                    self.emit_angles(&frame, sink);
                }
            }
            SyncUpdate::Missed { .. } => {
                if let Some(frame) = self.extractor.on_missed(bs as u32) {
                    self.emit_angles(&frame, sink);
                }
            }
            SyncUpdate::Lost => {
                self.slots[bs].decoder.reset();
                self.extractor.invalidate_station(bs as u32);
            }
        }
    }

    fn offer_sync(&mut self, pulse: &Pulse) {
        if let Some(last) = self.last_flash {
            if pulse.start_time.since(last) <= self.config.timing.sync_max_len {
                self.stats.merged_syncs = self.stats.merged_syncs.wrapping_add(1);
                return;
            }
        }
        self.last_flash = Some(pulse.start_time);

        // Synced stations claim their own flashes first. Slot 1 only
        // acquires while slot 0 holds a lock.
        for bs in 0..NUM_BASE_STATIONS {
            let tracker = &mut self.slots[bs].tracker;
            if tracker.is_synced() && tracker.offer(pulse) != Offer::Rejected {
                return;
            }
        }
        let acquiring = if !self.slots[0].tracker.is_synced() {
            Some(0)
        } else if !self.slots[1].tracker.is_synced() {
            Some(1)
        } else {
            None
        };
        let Some(bs) = acquiring else {
            self.stats.unclaimed_syncs = self.stats.unclaimed_syncs.wrapping_add(1);
            return;
        };
        match self.slots[bs].tracker.offer(pulse) {
            Offer::Locked => self.on_locked(bs),
            Offer::Accepted => {}
            Offer::Rejected => {
                self.stats.unclaimed_syncs = self.stats.unclaimed_syncs.wrapping_add(1);
            }
        }
    }

    fn on_locked(&mut self, bs: usize) {
        self.slots[bs].decoder.reset();
        self.extractor.invalidate_station(bs as u32);

        if !self.slots.iter().all(|s| s.tracker.is_synced()) {
            return;
        }
        // Slot 1 is the station whose flash follows the other's by less
        // than half a cycle.
        let period = self.config.timing.cycle_period.0 as i64;
        let t0 = self.slots[0].tracker.expected_sync();
        let t1 = self.slots[1].tracker.expected_sync();
        let lag = (t1.since(t0).0 as i64).rem_euclid(period);
        if lag > period / 2 {
            self.slots.swap(0, 1);
            self.slots[0].set_idx(0);
            self.slots[1].set_idx(1);
            self.extractor.swap_stations();
            self.stats.slot_swaps = self.stats.slot_swaps.wrapping_add(1);
            log_info!("base station slots swapped");
        }
    }

    fn station_views(&self) -> [StationView; NUM_BASE_STATIONS] {
        [self.slots[0].view(), self.slots[1].view()]
    }

    fn emit_angles(&mut self, frame: &SensorAnglesFrame, sink: &mut impl PipelineSink) {
        sink.on_angles(frame);
        let views = self.station_views();
        for pos in self
            .solver
            .solve(frame.time, self.extractor.angles(), &views)
            .iter()
        {
            sink.on_position(pos);
        }
    }

    /// Best level currently reached by any object.
    pub fn fix_level(&self) -> FixLevel {
        let views = self.station_views();
        let solved = self
            .solver
            .solve(Timestamp(0), self.extractor.angles(), &views)
            .iter()
            .map(|p| p.fix_level)
            .max();
        solved.unwrap_or_else(|| {
            views
                .iter()
                .map(|v| v.fix_level)
                .max()
                .unwrap_or(FixLevel::NoSignals)
        })
    }

    pub fn station_state(&self, bs: usize) -> Option<SyncState> {
        self.slots.get(bs).map(|s| s.tracker.state())
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped: self.inputs.iter().map(|i| i.dropped()).sum(),
            trackers: [self.slots[0].tracker.stats(), self.slots[1].tracker.stats()],
            data: [self.slots[0].decoder.stats(), self.slots[1].decoder.stats()],
            angles: self.extractor.stats(),
            ..self.stats
        }
    }

    /// Back to the cold-start state. Attached inputs stay attached.
    pub fn reset(&mut self) {
        self.slots = [
            StationSlot::new(0, &self.config),
            StationSlot::new(1, &self.config),
        ];
        self.extractor.reset();
        self.last_flash = None;
        self.stats = PipelineStats::default();
    }
}
