#![no_std]
#![no_main]

mod board;
mod tasks;
mod usb;

use embassy_executor::Spawner;
use embassy_stm32::exti::{Channel as _, ExtiInput};
use embassy_stm32::gpio::{Input, Level, Output, Pin, Pull, Speed};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use lighthouse_tracker::decoder::input::{InputNode, PulsePolarity};
use lighthouse_tracker::decoder::pulse_buffer::PulseCircularBuffer;
use lighthouse_tracker::{
    DataFrame, FixLevel, ObjectPosition, PipelineConfig, PipelineCoordinator, TimingConfig,
};

use crate::board::Board;
use crate::tasks::input_task::{input_task, NUM_SENSORS};
use crate::tasks::output_task::output_task;
use crate::tasks::pipeline_task::{self, pipeline_task};

// ── Inter-task channels ───────────────────────────────────────────────────────
static POSITION_CHAN: Channel<CriticalSectionRawMutex, ObjectPosition, 4> = Channel::new();
static DATA_FRAME_CHAN: Channel<CriticalSectionRawMutex, DataFrame, 2> = Channel::new();

// ── Pulse buffers (one per sensor, split between input and pipeline tasks) ────
static PULSE_BUFFERS: StaticCell<[PulseCircularBuffer; NUM_SENSORS]> = StaticCell::new();

/// Photodiode front ends drive the line high while lit.
const SENSOR_POLARITY: PulsePolarity = PulsePolarity::Positive;

// ── Main ──────────────────────────────────────────────────────────────────────
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // 1. Board init (168 MHz PLL, cycle counter)
    let Board { p } = Board::init();

    // 2. USB (CDC-ACM output stream)
    let (usb_dev, usb_serial) = usb::init(p.USB_OTG_FS, p.PA12, p.PA11);
    spawner.spawn(usb::usb_task(usb_dev)).unwrap();

    // 3. Pipeline, timed by the core clock
    let config = PipelineConfig {
        timing: TimingConfig::with_tick_rate(board::TICKS_PER_US),
        num_inputs: NUM_SENSORS,
        ..PipelineConfig::default()
    };
    let mut pipeline = match PipelineCoordinator::new(config) {
        Ok(p) => p,
        Err(e) => defmt::panic!("invalid pipeline config: {}", e),
    };

    // 4. Sensor inputs PA0..PA3 on EXTI0..3
    let max_pulse_len = pipeline.config().timing.max_input_pulse_len;
    let [b0, b1, b2, b3] = PULSE_BUFFERS.init([
        PulseCircularBuffer::new(),
        PulseCircularBuffer::new(),
        PulseCircularBuffer::new(),
        PulseCircularBuffer::new(),
    ]);
    let pins = [
        ExtiInput::new(Input::new(p.PA0.degrade(), Pull::Down), p.EXTI0.degrade()),
        ExtiInput::new(Input::new(p.PA1.degrade(), Pull::Down), p.EXTI1.degrade()),
        ExtiInput::new(Input::new(p.PA2.degrade(), Pull::Down), p.EXTI2.degrade()),
        ExtiInput::new(Input::new(p.PA3.degrade(), Pull::Down), p.EXTI3.degrade()),
    ];
    for (idx, (pin, buf)) in pins.into_iter().zip([b0, b1, b2, b3]).enumerate() {
        let (producer, consumer) = PulseCircularBuffer::split(buf);
        if let Err(e) = pipeline.attach_input(consumer) {
            defmt::panic!("sensor {}: {}", idx, e);
        }
        let node = InputNode::new(idx as u32, SENSOR_POLARITY, max_pulse_len, producer);
        spawner.spawn(input_task(pin, node)).unwrap();
    }

    // 5. Decoding and output
    spawner
        .spawn(pipeline_task(
            pipeline,
            POSITION_CHAN.sender(),
            DATA_FRAME_CHAN.sender(),
        ))
        .unwrap();

    spawner
        .spawn(output_task(
            usb_serial,
            POSITION_CHAN.receiver(),
            DATA_FRAME_CHAN.receiver(),
        ))
        .unwrap();

    // 6. Heartbeat LED (PC13): blink rate follows the fix level, solid on full fix
    let mut led = Output::new(p.PC13, Level::High, Speed::Low);
    loop {
        let half_period_ms = match pipeline_task::fix_level() {
            FixLevel::FullFix => {
                led.set_low();
                Timer::after(Duration::from_millis(100)).await;
                continue;
            }
            FixLevel::PartialVis => 100,
            FixLevel::CycleSynced | FixLevel::CycleSyncing => 250,
            FixLevel::NoSignals => 500,
        };
        led.toggle();
        Timer::after(Duration::from_millis(half_period_ms)).await;
    }
}
