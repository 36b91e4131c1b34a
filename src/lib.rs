#![cfg_attr(not(test), no_std)]

//! Lighthouse pulse-to-fix decoder.
//!
//! Turns photodiode pulse timings from two Lighthouse base stations into
//! per-sensor bearing angles, base-station data frames and object poses.
//! Everything here is allocation free and runs in a single cooperative main
//! loop; only [`decoder::pulse_buffer::PulseProducer::push`] is meant for
//! interrupt context.

#[macro_use]
pub mod log;

pub mod config;
pub mod decoder;
pub mod pipeline;
pub mod state;
pub mod synth;
pub mod time;

pub use config::{ConfigError, GeometryConfig, PipelineConfig, TimingConfig};
pub use pipeline::{PipelineCoordinator, PipelineSink, PipelineStats};
pub use state::{
    DataFrame, DataFrameBit, FixLevel, ObjectPosition, Pulse, SensorAngles, SensorAnglesFrame,
};
pub use time::{TimeDelta, Timestamp};
