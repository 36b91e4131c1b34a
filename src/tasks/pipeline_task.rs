use core::sync::atomic::{AtomicU32, Ordering};

use embassy_executor::task;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_time::{Duration, Ticker};

use lighthouse_tracker::{DataFrame, FixLevel, ObjectPosition, PipelineCoordinator, PipelineSink};

use crate::board;

/// Latest overall fix level, read by the heartbeat LED.
pub static FIX_LEVEL: AtomicU32 = AtomicU32::new(FixLevel::NoSignals as u32);

pub fn fix_level() -> FixLevel {
    match FIX_LEVEL.load(Ordering::Relaxed) {
        1000 => FixLevel::FullFix,
        500 => FixLevel::PartialVis,
        200 => FixLevel::CycleSynced,
        100 => FixLevel::CycleSyncing,
        _ => FixLevel::NoSignals,
    }
}

struct ChannelSink {
    positions: Sender<'static, CriticalSectionRawMutex, ObjectPosition, 4>,
    frames: Sender<'static, CriticalSectionRawMutex, DataFrame, 2>,
}

impl PipelineSink for ChannelSink {
    fn on_position(&mut self, position: &ObjectPosition) {
        // Output falling behind: drop rather than stall decoding
        let _ = self.positions.try_send(*position);
    }

    fn on_data_frame(&mut self, frame: &DataFrame) {
        let _ = self.frames.try_send(frame.clone());
    }
}

/// Decoding loop at 1 kHz. Drains the pulse buffers and publishes results.
#[task]
pub async fn pipeline_task(
    mut pipeline: PipelineCoordinator<'static>,
    positions: Sender<'static, CriticalSectionRawMutex, ObjectPosition, 4>,
    frames: Sender<'static, CriticalSectionRawMutex, DataFrame, 2>,
) {
    let mut sink = ChannelSink { positions, frames };
    let mut ticker = Ticker::every(Duration::from_hz(1000));
    let mut last_level = FixLevel::NoSignals;

    loop {
        ticker.next().await;
        pipeline.tick(board::now(), &mut sink);

        let level = pipeline.fix_level();
        if level != last_level {
            defmt::info!("fix level: {}", level.as_str());
            last_level = level;
            FIX_LEVEL.store(level as u32, Ordering::Relaxed);
        }
    }
}
