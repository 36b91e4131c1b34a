//! Edge captures → pulses.
//!
//! Hardware backends (comparator, timer capture, GPIO interrupt) only need
//! to report timestamped edges; [`InputNode`] pairs them into [`Pulse`]s and
//! hands them to a [`PulseSink`], normally the producer half of the sensor's
//! [`PulseCircularBuffer`](super::pulse_buffer::PulseCircularBuffer).

use crate::decoder::pulse_buffer::PulseSink;
use crate::time::{TimeDelta, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PulsePolarity {
    /// Light raises the line.
    Positive,
    /// Light pulls the line low.
    Negative,
}

pub struct InputNode<S: PulseSink> {
    input_idx: u32,
    polarity: PulsePolarity,
    max_pulse_len: TimeDelta,
    sink: S,
    pulse_start: Option<Timestamp>,
    rejected: u32,
}

impl<S: PulseSink> InputNode<S> {
    pub fn new(input_idx: u32, polarity: PulsePolarity, max_pulse_len: TimeDelta, sink: S) -> Self {
        Self {
            input_idx,
            polarity,
            max_pulse_len,
            sink,
            pulse_start: None,
            rejected: 0,
        }
    }

    /// Feed one edge. `level` is the line level right after the edge.
    pub fn on_edge(&mut self, time: Timestamp, level: bool) {
        let light_on = match self.polarity {
            PulsePolarity::Positive => level,
            PulsePolarity::Negative => !level,
        };

        if light_on {
            self.pulse_start = Some(time);
            return;
        }

        if let Some(start) = self.pulse_start.take() {
            let len = time.since(start);
            if len.0 <= 0 || len > self.max_pulse_len {
                self.rejected = self.rejected.wrapping_add(1);
                return;
            }
            self.sink.enqueue_pulse(self.input_idx, start, len);
        }
    }

    /// Pulses discarded for an implausible length.
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
