/// Pipeline configuration.
///
/// Timing values are in timer ticks. The defaults are the published
/// Lighthouse v1 timings expressed at a 48 MHz tick; use
/// [`TimingConfig::with_tick_rate`] when the capture timer runs at another
/// rate.
use core::fmt;

use crate::decoder::cycle_sync::MAX_ACQUIRE_CYCLES;
use crate::state::{MAX_NUM_INPUTS, MAX_NUM_OBJECTS, NUM_BASE_STATIONS};
use crate::time::TimeDelta;

// ── Lighthouse v1 timing @ 48 MHz ─────────────────────────────────────────────

/// Reference tick rate of the default constants.
pub const DEFAULT_TICKS_PER_US: u32 = 48;
/// 120 Hz sync rate → 8333.3 µs.
const CYCLE_PERIOD_TICKS: i32 = 400_000;
/// Shortest sync flash (code 0): 62.5 µs.
const SYNC_LEN_BASE_TICKS: i32 = 3_000;
/// Sync flash length increment per code step: 10.4 µs.
const SYNC_LEN_STEP_TICKS: i32 = 500;
/// Sync/sweep decision threshold: half a step below the shortest sync flash.
const SYNC_MIN_LEN_TICKS: i32 = SYNC_LEN_BASE_TICKS - SYNC_LEN_STEP_TICKS / 2;
/// Half a step above the longest sync flash (code 7).
const SYNC_MAX_LEN_TICKS: i32 = SYNC_LEN_BASE_TICKS + 7 * SYNC_LEN_STEP_TICKS + SYNC_LEN_STEP_TICKS / 2;
/// Shorter pulses are treated as glitches: 1 µs.
const SWEEP_MIN_LEN_TICKS: i32 = 48;
/// Sweep crossing time of a sensor on the station's optical axis: 4000 µs after sync.
const SWEEP_CENTER_OFFSET_TICKS: i32 = 192_000;
/// One rotor revolution (60 Hz): 16666.7 µs.
const ROTOR_PERIOD_TICKS: i32 = 800_000;
/// Allowed deviation of a sync flash from its predicted time: 50 µs.
const SYNC_TOLERANCE_TICKS: i32 = 2_400;
/// Pulses longer than this never come from a base station: 300 µs.
const MAX_INPUT_PULSE_LEN_TICKS: i32 = 14_400;

// ── Timing ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingConfig {
    pub ticks_per_us: u32,
    /// Nominal time between two sync flashes of the same base station.
    pub cycle_period: TimeDelta,
    /// Half-width of the predicted sync window.
    pub sync_tolerance: TimeDelta,
    /// Pulses at least this long (and at most `sync_max_len`) are sync flashes.
    pub sync_min_len: TimeDelta,
    pub sync_max_len: TimeDelta,
    /// Length of a code-0 sync flash.
    pub sync_len_base: TimeDelta,
    /// Length added per code step.
    pub sync_len_step: TimeDelta,
    pub sweep_min_len: TimeDelta,
    pub sweep_center_offset: TimeDelta,
    pub rotor_period: TimeDelta,
    pub max_input_pulse_len: TimeDelta,
    /// Consecutive periodic sync flashes needed to lock.
    pub acquire_cycles: u32,
    /// Consecutive missed windows tolerated while synced.
    pub max_missed_cycles: u32,
    /// Periods without any sync candidate before declaring no signal.
    pub signal_timeout_cycles: u32,
    /// Maximum age, in base-station cycles, of an angle still used for a fix.
    pub max_angle_age_cycles: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ticks_per_us: DEFAULT_TICKS_PER_US,
            cycle_period: TimeDelta(CYCLE_PERIOD_TICKS),
            sync_tolerance: TimeDelta(SYNC_TOLERANCE_TICKS),
            sync_min_len: TimeDelta(SYNC_MIN_LEN_TICKS),
            sync_max_len: TimeDelta(SYNC_MAX_LEN_TICKS),
            sync_len_base: TimeDelta(SYNC_LEN_BASE_TICKS),
            sync_len_step: TimeDelta(SYNC_LEN_STEP_TICKS),
            sweep_min_len: TimeDelta(SWEEP_MIN_LEN_TICKS),
            sweep_center_offset: TimeDelta(SWEEP_CENTER_OFFSET_TICKS),
            rotor_period: TimeDelta(ROTOR_PERIOD_TICKS),
            max_input_pulse_len: TimeDelta(MAX_INPUT_PULSE_LEN_TICKS),
            acquire_cycles: 3,
            max_missed_cycles: 3,
            signal_timeout_cycles: 30,
            max_angle_age_cycles: 8,
        }
    }
}

impl TimingConfig {
    /// Defaults rescaled to a timer running at `ticks_per_us`.
    pub fn with_tick_rate(ticks_per_us: u32) -> Self {
        let base = Self::default();
        let scale = |d: TimeDelta| {
            TimeDelta((d.0 as i64 * ticks_per_us as i64 / DEFAULT_TICKS_PER_US as i64) as i32)
        };
        Self {
            ticks_per_us,
            cycle_period: scale(base.cycle_period),
            sync_tolerance: scale(base.sync_tolerance),
            sync_min_len: scale(base.sync_min_len),
            sync_max_len: scale(base.sync_max_len),
            sync_len_base: scale(base.sync_len_base),
            sync_len_step: scale(base.sync_len_step),
            sweep_min_len: scale(base.sweep_min_len),
            sweep_center_offset: scale(base.sweep_center_offset),
            rotor_period: scale(base.rotor_period),
            max_input_pulse_len: scale(base.max_input_pulse_len),
            ..base
        }
    }

    /// Sweep offsets (relative to the sync flash) covering ±π/3.
    pub fn sweep_window(&self) -> (TimeDelta, TimeDelta) {
        let sixth = TimeDelta(self.rotor_period.0 / 6);
        (
            self.sweep_center_offset - sixth,
            self.sweep_center_offset + sixth,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_us == 0 || self.cycle_period.0 <= 0 || self.rotor_period.0 <= 0 {
            return Err(ConfigError::NonPositivePeriod);
        }
        if self.sync_len_step.0 <= 0
            || self.sync_min_len.0 <= 0
            || self.sync_min_len > self.sync_max_len
        {
            return Err(ConfigError::SyncLengthRange);
        }
        if self.sweep_min_len >= self.sync_min_len {
            return Err(ConfigError::SweepLengthAboveSync);
        }
        if self.sync_tolerance.0 <= 0 || self.sync_tolerance.0 * 4 >= self.cycle_period.0 {
            return Err(ConfigError::SyncToleranceTooWide);
        }
        if self.acquire_cycles < 2 || self.acquire_cycles > MAX_ACQUIRE_CYCLES {
            return Err(ConfigError::AcquireCyclesOutOfRange);
        }
        let (start, end) = self.sweep_window();
        if start.0 <= 0 || end >= self.cycle_period {
            return Err(ConfigError::SweepWindowOutsideCycle);
        }
        Ok(())
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Pose of a base station in the world frame.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BaseStationGeometry {
    pub origin: [f32; 3],
    /// Row-major rotation from station frame to world frame.
    pub mat: [f32; 9],
}

impl BaseStationGeometry {
    pub const IDENTITY_MAT: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    pub fn at(origin: [f32; 3]) -> Self {
        Self {
            origin,
            mat: Self::IDENTITY_MAT,
        }
    }
}

/// Sensor position within its object's frame.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorLocalGeometry {
    pub input_idx: u32,
    pub pos: [f32; 3],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectGeometry {
    pub sensors: heapless::Vec<SensorLocalGeometry, MAX_NUM_INPUTS>,
}

impl ObjectGeometry {
    pub fn with_sensors(sensors: &[SensorLocalGeometry]) -> Self {
        let mut obj = Self::default();
        for s in sensors.iter().take(MAX_NUM_INPUTS) {
            let _ = obj.sensors.push(*s);
        }
        obj
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeometryConfig {
    pub base_stations: [BaseStationGeometry; NUM_BASE_STATIONS],
    pub objects: heapless::Vec<ObjectGeometry, MAX_NUM_OBJECTS>,
}

impl Default for GeometryConfig {
    /// Two stations 2 m apart looking down -Z, one object made of sensor 0.
    fn default() -> Self {
        let mut objects = heapless::Vec::new();
        let _ = objects.push(ObjectGeometry::with_sensors(&[SensorLocalGeometry {
            input_idx: 0,
            pos: [0.0; 3],
        }]));
        Self {
            base_stations: [
                BaseStationGeometry::at([-1.0, 0.0, 0.0]),
                BaseStationGeometry::at([1.0, 0.0, 0.0]),
            ],
            objects,
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub timing: TimingConfig,
    pub geometry: GeometryConfig,
    /// Sensors wired to the pipeline, indices `0..num_inputs`.
    pub num_inputs: usize,
    /// Bit `i` set: sensor `i` may contribute sync flashes.
    pub sync_input_mask: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            geometry: GeometryConfig::default(),
            num_inputs: 1,
            sync_input_mask: 0xFF,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;

        if self.num_inputs == 0 {
            return Err(ConfigError::NoInputs);
        }
        if self.num_inputs > MAX_NUM_INPUTS {
            return Err(ConfigError::TooManyInputs);
        }
        let wired = if self.num_inputs >= 8 {
            0xFF
        } else {
            (1u8 << self.num_inputs) - 1
        };
        if self.sync_input_mask & wired == 0 {
            return Err(ConfigError::NoSyncInputs);
        }

        for (object_idx, obj) in self.geometry.objects.iter().enumerate() {
            if obj.sensors.is_empty() {
                return Err(ConfigError::EmptyObject { object_idx });
            }
            for (i, s) in obj.sensors.iter().enumerate() {
                if s.input_idx as usize >= self.num_inputs {
                    return Err(ConfigError::SensorInputOutOfRange {
                        object_idx,
                        input_idx: s.input_idx,
                    });
                }
                if obj.sensors[..i].iter().any(|o| o.input_idx == s.input_idx) {
                    return Err(ConfigError::DuplicateSensor {
                        object_idx,
                        input_idx: s.input_idx,
                    });
                }
            }
        }

        for bs in self.geometry.base_stations.iter() {
            if bs.origin.iter().chain(bs.mat.iter()).any(|v| !v.is_finite()) {
                return Err(ConfigError::NonFiniteGeometry);
            }
        }
        Ok(())
    }

    pub fn is_sync_input(&self, input_idx: u32) -> bool {
        input_idx < 8 && self.sync_input_mask & (1 << input_idx) != 0
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NoInputs,
    TooManyInputs,
    NoSyncInputs,
    NonPositivePeriod,
    SyncLengthRange,
    SweepLengthAboveSync,
    SyncToleranceTooWide,
    AcquireCyclesOutOfRange,
    SweepWindowOutsideCycle,
    NonFiniteGeometry,
    EmptyObject { object_idx: usize },
    SensorInputOutOfRange { object_idx: usize, input_idx: u32 },
    DuplicateSensor { object_idx: usize, input_idx: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoInputs => write!(f, "no inputs configured"),
            ConfigError::TooManyInputs => write!(f, "more than {} inputs", MAX_NUM_INPUTS),
            ConfigError::NoSyncInputs => write!(f, "sync input mask selects no wired input"),
            ConfigError::NonPositivePeriod => write!(f, "tick rate and periods must be positive"),
            ConfigError::SyncLengthRange => write!(f, "invalid sync pulse length range"),
            ConfigError::SweepLengthAboveSync => {
                write!(f, "minimum sweep length must be below the sync threshold")
            }
            ConfigError::SyncToleranceTooWide => {
                write!(f, "sync tolerance must be positive and under a quarter period")
            }
            ConfigError::AcquireCyclesOutOfRange => {
                write!(f, "acquisition needs 2..={} cycles", MAX_ACQUIRE_CYCLES)
            }
            ConfigError::SweepWindowOutsideCycle => {
                write!(f, "sweep window does not fit inside one cycle")
            }
            ConfigError::NonFiniteGeometry => write!(f, "base station geometry is not finite"),
            ConfigError::EmptyObject { object_idx } => {
                write!(f, "object {} has no sensors", object_idx)
            }
            ConfigError::SensorInputOutOfRange {
                object_idx,
                input_idx,
            } => write!(f, "object {} uses unwired input {}", object_idx, input_idx),
            ConfigError::DuplicateSensor {
                object_idx,
                input_idx,
            } => write!(f, "object {} lists input {} twice", object_idx, input_idx),
        }
    }
}
