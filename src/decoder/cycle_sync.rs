//! Per base station sync flash tracking.
//!
//! State machine:
//!
//! ```text
//!  NoSignal ──candidate──▶ Acquiring ──locked──▶ Synced
//!     ▲                      ▲    │                │
//!     └──────timeout─────────┼────┘      miss limit│
//!     ▲                      │                     ▼
//!     └──────timeout──────── Lost ◀────────────────┘
//!                            (restart → Acquiring)
//! ```
//!
//! While acquiring, sync candidates are kept in a short history and a lock is
//! declared once the newest candidate closes a chain of `acquire_cycles`
//! flashes spaced one period apart. While synced, each cycle opens a window
//! around the predicted flash time; the best candidate inside it is committed
//! when the window closes.

use heapless::Vec;

use crate::config::TimingConfig;
use crate::state::{FixLevel, Pulse};
use crate::time::{TimeDelta, Timestamp};

const HISTORY_LEN: usize = 16;
/// Longest acquisition chain the history can hold next to a second station.
pub const MAX_ACQUIRE_CYCLES: u32 = (HISTORY_LEN / 2) as u32;

// ── Pulse classification ──────────────────────────────────────────────────────

/// Information carried by the length of a sync flash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncCode {
    /// Sweep axis announced for this cycle.
    pub axis: u8,
    /// Data channel bit.
    pub data: bool,
    /// Station does not sweep this cycle.
    pub skip: bool,
}

impl SyncCode {
    pub fn from_bits(code: u8) -> Self {
        Self {
            axis: code & 1,
            data: code & 2 != 0,
            skip: code & 4 != 0,
        }
    }

    pub fn bits(self) -> u8 {
        (self.axis & 1) | ((self.data as u8) << 1) | ((self.skip as u8) << 2)
    }

    /// Nearest code for a flash of length `len`.
    pub fn from_len(len: TimeDelta, timing: &TimingConfig) -> Self {
        let step = timing.sync_len_step.0.max(1);
        let steps = (len.0 - timing.sync_len_base.0 + step / 2).div_euclid(step);
        Self::from_bits(steps.clamp(0, 7) as u8)
    }

    /// Nominal flash length for this code.
    pub fn pulse_len(self, timing: &TimingConfig) -> TimeDelta {
        TimeDelta(timing.sync_len_base.0 + self.bits() as i32 * timing.sync_len_step.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PulseClass {
    Sync(SyncCode),
    Sweep,
    /// Too short to be a sweep or too long to be a sync flash.
    Noise,
}

pub fn classify_pulse(len: TimeDelta, timing: &TimingConfig) -> PulseClass {
    if len >= timing.sync_min_len {
        if len <= timing.sync_max_len {
            PulseClass::Sync(SyncCode::from_len(len, timing))
        } else {
            PulseClass::Noise
        }
    } else if len >= timing.sweep_min_len {
        PulseClass::Sweep
    } else {
        PulseClass::Noise
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncState {
    NoSignal,
    Acquiring,
    Synced,
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncEvent {
    /// A sync candidate was observed.
    Candidate,
    /// The candidate history formed a periodic chain.
    Locked,
    /// A predicted window closed with a matching flash.
    Confirmed,
    /// A predicted window closed empty, within the tolerated miss count.
    Missed,
    /// Too many consecutive empty windows.
    MissLimitExceeded,
    /// Leave `Lost` and start collecting candidates again.
    Restart,
    /// No candidate for the signal timeout.
    Timeout,
}

impl SyncState {
    /// Transition table.
    pub fn next(self, event: SyncEvent) -> SyncState {
        use SyncEvent::*;
        use SyncState::*;
        match (self, event) {
            (NoSignal, Candidate) => Acquiring,
            (Acquiring, Locked) => Synced,
            (Acquiring, Timeout) => NoSignal,
            (Synced, MissLimitExceeded) => Lost,
            (Lost, Restart) => Acquiring,
            (Lost, Timeout) => NoSignal,
            (state, _) => state,
        }
    }

    pub fn fix_level(self) -> FixLevel {
        match self {
            SyncState::NoSignal => FixLevel::NoSignals,
            SyncState::Acquiring | SyncState::Lost => FixLevel::CycleSyncing,
            SyncState::Synced => FixLevel::CycleSynced,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::NoSignal => "no_signal",
            SyncState::Acquiring => "acquiring",
            SyncState::Synced => "synced",
            SyncState::Lost => "lost",
        }
    }
}

// ── Tracker ───────────────────────────────────────────────────────────────────

/// A committed sync flash: start of a new cycle for one base station.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CycleTick {
    pub base_station_idx: u32,
    pub cycle_idx: u32,
    pub time: Timestamp,
    pub pulse_len: TimeDelta,
    pub code: SyncCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncUpdate {
    Tick(CycleTick),
    /// The window of `cycle_idx` closed without a flash.
    Missed { cycle_idx: u32 },
    /// Synchronization dropped.
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Offer {
    /// Not for this station.
    Rejected,
    /// Taken: matched, kept as acquisition history or discarded as a tie loser.
    Accepted,
    /// Taken and completed acquisition.
    Locked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrackerStats {
    pub locks: u32,
    pub losses: u32,
    pub missed_windows: u32,
    /// Second candidates inside an already matched window.
    pub discarded_candidates: u32,
}

pub struct CycleSyncTracker {
    base_station_idx: u32,
    timing: TimingConfig,
    state: SyncState,
    /// Candidate start times while acquiring, oldest first.
    history: Vec<Timestamp, HISTORY_LEN>,
    last_candidate: Option<Timestamp>,
    /// Center of the currently open window.
    expected: Timestamp,
    /// Index of the currently open window.
    cycle_idx: u32,
    missed: u32,
    pending: Option<Pulse>,
    stats: TrackerStats,
}

impl CycleSyncTracker {
    pub fn new(base_station_idx: u32, timing: TimingConfig) -> Self {
        Self {
            base_station_idx,
            timing,
            state: SyncState::NoSignal,
            history: Vec::new(),
            last_candidate: None,
            expected: Timestamp(0),
            cycle_idx: 0,
            missed: 0,
            pending: None,
            stats: TrackerStats::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    pub fn fix_level(&self) -> FixLevel {
        self.state.fix_level()
    }

    pub fn base_station_idx(&self) -> u32 {
        self.base_station_idx
    }

    pub fn set_base_station_idx(&mut self, idx: u32) {
        self.base_station_idx = idx;
    }

    /// Index of the cycle whose window is currently open.
    pub fn cycle_idx(&self) -> u32 {
        self.cycle_idx
    }

    /// Center of the next sync window; meaningful while synced.
    pub fn expected_sync(&self) -> Timestamp {
        self.expected
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    fn apply(&mut self, event: SyncEvent) {
        let next = self.state.next(event);
        if next != self.state {
            log_debug!(
                "bs{} sync {} -> {}",
                self.base_station_idx,
                self.state.as_str(),
                next.as_str()
            );
            self.state = next;
        }
    }

    /// Advance the clock to `now`. Returns at most one update per call;
    /// call repeatedly until `None` before offering a pulse starting at `now`.
    pub fn poll(&mut self, now: Timestamp) -> Option<SyncUpdate> {
        match self.state {
            SyncState::NoSignal => None,
            SyncState::Lost => {
                self.history.clear();
                self.apply(SyncEvent::Restart);
                self.check_timeout(now);
                None
            }
            SyncState::Acquiring => {
                self.check_timeout(now);
                None
            }
            SyncState::Synced => {
                let window_end = self.expected + self.timing.sync_tolerance;
                if !window_end.is_before(now) {
                    return None;
                }
                Some(self.close_window())
            }
        }
    }

    fn close_window(&mut self) -> SyncUpdate {
        let cycle_idx = self.cycle_idx;
        self.cycle_idx = self.cycle_idx.wrapping_add(1);

        if let Some(p) = self.pending.take() {
            self.apply(SyncEvent::Confirmed);
            self.missed = 0;
            self.last_candidate = Some(p.start_time);
            self.expected = p.start_time + self.timing.cycle_period;
            return SyncUpdate::Tick(CycleTick {
                base_station_idx: self.base_station_idx,
                cycle_idx,
                time: p.start_time,
                pulse_len: p.pulse_len,
                code: SyncCode::from_len(p.pulse_len, &self.timing),
            });
        }

        self.missed += 1;
        self.stats.missed_windows = self.stats.missed_windows.wrapping_add(1);
        self.expected += self.timing.cycle_period;
        if self.missed > self.timing.max_missed_cycles {
            self.apply(SyncEvent::MissLimitExceeded);
            self.stats.losses = self.stats.losses.wrapping_add(1);
            log_warn!(
                "bs{} lost sync after {} missed cycles",
                self.base_station_idx,
                self.missed
            );
            SyncUpdate::Lost
        } else {
            self.apply(SyncEvent::Missed);
            SyncUpdate::Missed { cycle_idx }
        }
    }

    fn check_timeout(&mut self, now: Timestamp) {
        let Some(last) = self.last_candidate else {
            return;
        };
        let limit = self.timing.cycle_period.0 as i64 * self.timing.signal_timeout_cycles as i64;
        if now.since(last).0 as i64 > limit {
            self.history.clear();
            self.last_candidate = None;
            self.apply(SyncEvent::Timeout);
        }
    }

    /// Offer a sync-length pulse. The caller must have polled up to
    /// `pulse.start_time` first.
    pub fn offer(&mut self, pulse: &Pulse) -> Offer {
        match self.state {
            SyncState::Synced => self.offer_synced(pulse),
            SyncState::NoSignal | SyncState::Acquiring | SyncState::Lost => {
                self.apply(SyncEvent::Candidate);
                if self.state == SyncState::Lost {
                    self.history.clear();
                    self.apply(SyncEvent::Restart);
                }
                self.offer_acquiring(pulse)
            }
        }
    }

    fn offer_synced(&mut self, pulse: &Pulse) -> Offer {
        let dist = pulse.start_time.since(self.expected).abs();
        if dist > self.timing.sync_tolerance {
            return Offer::Rejected;
        }
        match self.pending {
            Some(prev) if prev.start_time.since(self.expected).abs() <= dist => {
                self.stats.discarded_candidates = self.stats.discarded_candidates.wrapping_add(1);
            }
            Some(_) => {
                self.stats.discarded_candidates = self.stats.discarded_candidates.wrapping_add(1);
                self.pending = Some(*pulse);
            }
            None => self.pending = Some(*pulse),
        }
        Offer::Accepted
    }

    fn offer_acquiring(&mut self, pulse: &Pulse) -> Offer {
        let now = pulse.start_time;
        self.last_candidate = Some(now);

        // Forget candidates too old to be part of a chain ending now.
        let horizon = self.timing.cycle_period.0 as i64 * self.timing.acquire_cycles as i64
            + self.timing.sync_tolerance.0 as i64;
        while let Some(&oldest) = self.history.first() {
            if now.since(oldest).0 as i64 > horizon {
                self.history.remove(0);
            } else {
                break;
            }
        }
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(now);

        if self.chain_len() < self.timing.acquire_cycles {
            return Offer::Accepted;
        }

        self.history.clear();
        self.apply(SyncEvent::Locked);
        self.stats.locks = self.stats.locks.wrapping_add(1);
        self.cycle_idx = 0;
        self.missed = 0;
        self.expected = now;
        self.pending = Some(*pulse);
        log_info!("bs{} sync locked", self.base_station_idx);
        Offer::Locked
    }

    /// Number of periodic flashes ending at the newest candidate.
    fn chain_len(&self) -> u32 {
        let Some((&newest, older)) = self.history.split_last() else {
            return 0;
        };
        let period = self.timing.cycle_period.0;
        let tol = self.timing.sync_tolerance.0;

        let mut cur = newest;
        let mut len = 1;
        for &cand in older.iter().rev() {
            let gap = cur.since(cand).0;
            if (gap - period).abs() <= tol {
                cur = cand;
                len += 1;
            } else if gap > period + tol {
                break;
            }
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: i32 = 400_000;

    fn timing() -> TimingConfig {
        TimingConfig::default()
    }

    fn sync(t: u32, code: u8) -> Pulse {
        let tm = timing();
        Pulse {
            input_idx: 0,
            start_time: Timestamp(t),
            pulse_len: SyncCode::from_bits(code).pulse_len(&tm),
        }
    }

    /// Polls until idle, collecting updates.
    fn drain(tr: &mut CycleSyncTracker, now: u32) -> std::vec::Vec<SyncUpdate> {
        let mut out = std::vec::Vec::new();
        while let Some(u) = tr.poll(Timestamp(now)) {
            out.push(u);
        }
        out
    }

    fn feed(tr: &mut CycleSyncTracker, p: &Pulse) -> (std::vec::Vec<SyncUpdate>, Offer) {
        let ups = drain(tr, p.start_time.0);
        let offer = tr.offer(p);
        (ups, offer)
    }

    #[test]
    fn transition_table() {
        use SyncEvent::*;
        use SyncState::*;
        assert_eq!(NoSignal.next(Candidate), Acquiring);
        assert_eq!(NoSignal.next(Locked), NoSignal);
        assert_eq!(Acquiring.next(Locked), Synced);
        assert_eq!(Acquiring.next(Timeout), NoSignal);
        assert_eq!(Synced.next(Missed), Synced);
        assert_eq!(Synced.next(MissLimitExceeded), Lost);
        assert_eq!(Synced.next(Timeout), Synced);
        assert_eq!(Lost.next(Restart), Acquiring);
        assert_eq!(Lost.next(Timeout), NoSignal);
    }

    #[test]
    fn classification_boundary_is_deterministic() {
        let t = timing();
        let th = t.sync_min_len;
        assert!(matches!(classify_pulse(th, &t), PulseClass::Sync(_)));
        assert!(matches!(classify_pulse(TimeDelta(th.0 + 1), &t), PulseClass::Sync(_)));
        assert_eq!(classify_pulse(TimeDelta(th.0 - 1), &t), PulseClass::Sweep);

        let max = t.sync_max_len;
        assert!(matches!(classify_pulse(max, &t), PulseClass::Sync(_)));
        assert_eq!(classify_pulse(TimeDelta(max.0 + 1), &t), PulseClass::Noise);

        let min = t.sweep_min_len;
        assert_eq!(classify_pulse(min, &t), PulseClass::Sweep);
        assert_eq!(classify_pulse(TimeDelta(min.0 - 1), &t), PulseClass::Noise);
    }

    #[test]
    fn sync_code_follows_length_steps() {
        let t = timing();
        for bits in 0..8u8 {
            let code = SyncCode::from_bits(bits);
            assert_eq!(code.bits(), bits);
            let len = code.pulse_len(&t);
            assert_eq!(SyncCode::from_len(len, &t), code);
            // Jitter below half a step keeps the code.
            assert_eq!(SyncCode::from_len(TimeDelta(len.0 + 200), &t), code);
            assert_eq!(SyncCode::from_len(TimeDelta(len.0 - 200), &t), code);
        }
        let c = SyncCode::from_bits(0b110);
        assert!(c.skip && c.data && c.axis == 0);
    }

    #[test]
    fn locks_within_acquire_cycles_and_stays_synced() {
        let mut tr = CycleSyncTracker::new(0, timing());
        assert_eq!(tr.state(), SyncState::NoSignal);

        let n = timing().acquire_cycles;
        let mut ticks = 0;
        for k in 0..20u32 {
            let (ups, offer) = feed(&mut tr, &sync(1_000 + k * P as u32, 0));
            ticks += ups.iter().filter(|u| matches!(u, SyncUpdate::Tick(_))).count();
            if k + 1 < n {
                assert_eq!(offer, Offer::Accepted);
                assert_eq!(tr.state(), SyncState::Acquiring);
            } else if k + 1 == n {
                assert_eq!(offer, Offer::Locked);
            } else {
                assert_eq!(offer, Offer::Accepted);
            }
            if k + 1 >= n {
                assert!(tr.is_synced());
            }
        }
        assert_eq!(ticks, (20 - n) as usize);
        assert_eq!(tr.stats().missed_windows, 0);
    }

    #[test]
    fn ticks_count_cycles_from_lock() {
        let mut tr = CycleSyncTracker::new(1, timing());
        let mut seen = std::vec::Vec::new();
        for k in 0..6u32 {
            let (ups, _) = feed(&mut tr, &sync(k * P as u32, (k % 2) as u8 * 2));
            for u in ups {
                if let SyncUpdate::Tick(t) = u {
                    seen.push((t.cycle_idx, t.code.data, t.base_station_idx));
                }
            }
        }
        // Locked on the third flash (k = 2); k = 2..4 committed so far.
        assert_eq!(seen, vec![(0, false, 1), (1, true, 1), (2, false, 1)]);
    }

    #[test]
    fn jitter_within_tolerance_is_tracked() {
        let mut tr = CycleSyncTracker::new(0, timing());
        let jitter = [0i32, 900, -800, 1_500, -500, 1_200, 0, -700];
        let mut t: i64 = 10_000;
        for j in jitter {
            t += P as i64;
            feed(&mut tr, &sync((t + j as i64) as u32, 0));
        }
        assert!(tr.is_synced());
        assert_eq!(tr.stats().missed_windows, 0);
    }

    #[test]
    fn demotes_after_too_many_missed_windows() {
        let t = timing();
        let mut tr = CycleSyncTracker::new(0, t);
        for k in 0..4u32 {
            feed(&mut tr, &sync(k * P as u32, 0));
        }
        assert!(tr.is_synced());

        // Silence: close windows one by one.
        let mut last = 3 * P as u32;
        let mut misses = 0;
        let mut lost = false;
        for k in 4..20u32 {
            last = k * P as u32 + 10_000;
            for u in drain(&mut tr, last) {
                match u {
                    SyncUpdate::Missed { .. } => misses += 1,
                    SyncUpdate::Lost => lost = true,
                    SyncUpdate::Tick(_) => {}
                }
            }
            if lost {
                break;
            }
        }
        assert!(lost);
        assert_eq!(misses, t.max_missed_cycles);
        assert!(!tr.is_synced());
        assert_eq!(tr.stats().losses, 1);

        drain(&mut tr, last + 1);
        assert_eq!(tr.state(), SyncState::Acquiring);
    }

    #[test]
    fn single_gap_is_bridged() {
        let mut tr = CycleSyncTracker::new(0, timing());
        for k in [0u32, 1, 2, 3, 5, 6, 7] {
            feed(&mut tr, &sync(k * P as u32, 0));
        }
        assert!(tr.is_synced());
        assert_eq!(tr.stats().missed_windows, 1);
        // Window indices keep counting through the gap.
        assert_eq!(tr.cycle_idx(), 5);
    }

    #[test]
    fn closer_candidate_wins_the_window() {
        let mut tr = CycleSyncTracker::new(0, timing());
        for k in 0..3u32 {
            feed(&mut tr, &sync(k * P as u32, 0));
        }
        drain(&mut tr, 2 * P as u32 + 50_000);

        let center = 3 * P as u32;
        feed(&mut tr, &sync(center + 2_000, 2));
        feed(&mut tr, &sync(center - 300, 0));
        feed(&mut tr, &sync(center + 1_000, 2));

        let ups = drain(&mut tr, center + 100_000);
        match ups.as_slice() {
            [SyncUpdate::Tick(t)] => {
                assert_eq!(t.time, Timestamp(center - 300));
                assert!(!t.code.data);
            }
            other => panic!("unexpected updates {:?}", other),
        }
        assert_eq!(tr.stats().discarded_candidates, 2);
    }

    #[test]
    fn pulses_outside_the_window_are_rejected() {
        let mut tr = CycleSyncTracker::new(0, timing());
        for k in 0..3u32 {
            feed(&mut tr, &sync(k * P as u32, 0));
        }
        // Second station ~400 µs behind the first.
        let (_, offer) = feed(&mut tr, &sync(2 * P as u32 + 19_200, 0));
        assert_eq!(offer, Offer::Rejected);
        assert!(tr.is_synced());
    }

    #[test]
    fn interleaved_station_does_not_block_acquisition() {
        let mut tr = CycleSyncTracker::new(0, timing());
        let mut locked = false;
        for k in 0..3u32 {
            let base = k * P as u32;
            if feed(&mut tr, &sync(base, 0)).1 == Offer::Locked {
                locked = true;
            }
            if feed(&mut tr, &sync(base + 19_200, 0)).1 == Offer::Locked {
                locked = true;
            }
        }
        assert!(locked);
        assert!(tr.is_synced());
    }

    #[test]
    fn aperiodic_candidates_never_lock() {
        let mut tr = CycleSyncTracker::new(0, timing());
        let times = [0u32, 130_000, 290_000, 610_000, 700_000, 1_000_000, 1_150_000];
        for t in times {
            assert_ne!(feed(&mut tr, &sync(t, 0)).1, Offer::Locked);
        }
        assert_eq!(tr.state(), SyncState::Acquiring);
    }

    #[test]
    fn silence_while_acquiring_returns_to_no_signal() {
        let t = timing();
        let mut tr = CycleSyncTracker::new(0, t);
        feed(&mut tr, &sync(0, 0));
        assert_eq!(tr.state(), SyncState::Acquiring);
        let later = (P as u32) * (t.signal_timeout_cycles + 1);
        drain(&mut tr, later);
        assert_eq!(tr.state(), SyncState::NoSignal);
        assert_eq!(tr.fix_level(), FixLevel::NoSignals);
    }

    #[test]
    fn reacquires_with_fresh_cycle_numbering() {
        let mut tr = CycleSyncTracker::new(0, timing());
        for k in 0..10u32 {
            feed(&mut tr, &sync(k * P as u32, 0));
        }
        assert!(tr.cycle_idx() > 5);
        drain(&mut tr, 20 * P as u32);
        assert!(!tr.is_synced());

        let restart = 30 * P as u32;
        let mut first_tick = None;
        for k in 0..5u32 {
            let (ups, _) = feed(&mut tr, &sync(restart + k * P as u32, 0));
            for u in ups {
                if let (SyncUpdate::Tick(t), None) = (u, first_tick) {
                    first_tick = Some(t.cycle_idx);
                }
            }
        }
        assert!(tr.is_synced());
        assert_eq!(first_tick, Some(0));
        assert_eq!(tr.stats().locks, 2);
    }
}
