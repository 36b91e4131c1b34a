/// Data contracts exchanged between the pulse inputs, the decoding pipeline
/// and the output consumers.
///
/// Everything that crosses a component boundary is a value snapshot: small
/// types are `Copy`, frame types own fixed-capacity `heapless` storage.
use crate::time::{TimeDelta, Timestamp};

// ── Fixed system constants ────────────────────────────────────────────────────

/// Number of concurrent sensors supported.
pub const MAX_NUM_INPUTS: usize = 8;
/// Largest payload accepted in a base-station data frame.
pub const MAX_BYTES_IN_DATA_FRAME: usize = 64;
/// Pulses buffered per sensor between interrupt and main loop.
pub const PULSES_BUFFER_LEN: usize = 32;
/// Tracked objects (each a rigid set of sensors).
pub const MAX_NUM_OBJECTS: usize = 4;

/// Lighthouse system constant: two base stations.
pub const NUM_BASE_STATIONS: usize = 2;
/// Lighthouse system constant: each station sweeps two axes, so four phases.
pub const NUM_CYCLE_PHASES: usize = 4;

/// `updated_cycles` sentinel for an angle that was never measured.
pub const NEVER_UPDATED: u32 = u32::MAX;

// ── Pulses ────────────────────────────────────────────────────────────────────

/// One detected light pulse on one sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pulse {
    pub input_idx: u32,
    pub start_time: Timestamp,
    pub pulse_len: TimeDelta,
}

impl Pulse {
    pub fn end_time(&self) -> Timestamp {
        self.start_time + self.pulse_len
    }

    pub fn center(&self) -> Timestamp {
        self.start_time + self.pulse_len.half()
    }
}

// ── Fix level ─────────────────────────────────────────────────────────────────

/// Confidence of a fix, ordered by information completeness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum FixLevel {
    /// No signals visible at all.
    #[default]
    NoSignals = 0,
    /// Sync pulses are visible and we're syncing to them.
    CycleSyncing = 100,
    /// Synced to the base station sync pulses.
    CycleSynced = 200,
    /// Position available, orientation is not.
    PartialVis = 500,
    /// Position and orientation available.
    FullFix = 1000,
}

impl FixLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FixLevel::NoSignals => "NO_SIGNALS",
            FixLevel::CycleSyncing => "CYCLE_SYNCING",
            FixLevel::CycleSynced => "CYCLE_SYNCED",
            FixLevel::PartialVis => "PARTIAL_VIS",
            FixLevel::FullFix => "FULL_FIX",
        }
    }
}

// ── Angles ────────────────────────────────────────────────────────────────────

/// Bearing angles of one sensor, one slot per cycle phase.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorAngles {
    /// Radians, within [-π/3, π/3].
    pub angles: [f32; NUM_CYCLE_PHASES],
    /// Cycle id of the owning base station when each angle was last written.
    pub updated_cycles: [u32; NUM_CYCLE_PHASES],
}

impl Default for SensorAngles {
    fn default() -> Self {
        Self {
            angles: [0.0; NUM_CYCLE_PHASES],
            updated_cycles: [NEVER_UPDATED; NUM_CYCLE_PHASES],
        }
    }
}

impl SensorAngles {
    /// Angle of `phase_id` if it was written no more than `max_age` cycles
    /// before `current_cycle`.
    pub fn fresh_angle(&self, phase_id: usize, current_cycle: u32, max_age: u32) -> Option<f32> {
        let updated = self.updated_cycles[phase_id];
        if updated == NEVER_UPDATED {
            return None;
        }
        if current_cycle.wrapping_sub(updated) <= max_age {
            Some(self.angles[phase_id])
        } else {
            None
        }
    }

    pub fn invalidate(&mut self, phase_id: usize) {
        self.updated_cycles[phase_id] = NEVER_UPDATED;
    }
}

/// Angles of all sensors, snapshotted when one phase completes.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorAnglesFrame {
    pub time: Timestamp,
    pub cycle_idx: u32,
    pub phase_id: i32,
    pub sensors: heapless::Vec<SensorAngles, MAX_NUM_INPUTS>,
}

// ── Data channel ──────────────────────────────────────────────────────────────

/// One bit of a base station's data channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataFrameBit {
    pub time: Timestamp,
    pub base_station_idx: u32,
    pub cycle_idx: u32,
    pub bit: bool,
}

/// A complete, checksum-verified payload from one base station.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub time: Timestamp,
    pub base_station_idx: u32,
    pub bytes: heapless::Vec<u8, MAX_BYTES_IN_DATA_FRAME>,
}

// ── Result ────────────────────────────────────────────────────────────────────

/// Pose of one tracked object.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectPosition {
    pub time: Timestamp,
    pub object_idx: u32,
    pub fix_level: FixLevel,
    /// Metres, base-station coordinate system. NaN when not triangulated.
    /// At `FullFix` this is the object origin; at `PartialVis` it is the
    /// centroid of the triangulated sensors.
    pub pos: [f32; 3],
    /// Distance between base station rays; position uncertainty proxy. NaN when not triangulated.
    pub pos_delta: f32,
    /// Rotation quaternion (w, x, y, z); unit when no rotation information is available.
    pub q: [f32; 4],
}

impl ObjectPosition {
    pub const UNIT_Q: [f32; 4] = [1.0, 0.0, 0.0, 0.0];

    /// Degraded result carrying only a confidence level.
    pub fn unresolved(time: Timestamp, object_idx: u32, fix_level: FixLevel) -> Self {
        Self {
            time,
            object_idx,
            fix_level,
            pos: [f32::NAN; 3],
            pos_delta: f32::NAN,
            q: Self::UNIT_Q,
        }
    }

    pub fn has_position(&self) -> bool {
        self.fix_level >= FixLevel::PartialVis
    }
}
