use embassy_executor::task;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::AnyPin;

use lighthouse_tracker::decoder::input::InputNode;
use lighthouse_tracker::decoder::pulse_buffer::PulseProducer;

use crate::board;

pub const NUM_SENSORS: usize = 4;

/// Sensor input: timestamps every edge of one photodiode line.
#[task(pool_size = NUM_SENSORS)]
pub async fn input_task(
    mut pin: ExtiInput<'static, AnyPin>,
    mut node: InputNode<PulseProducer<'static>>,
) {
    loop {
        pin.wait_for_any_edge().await;
        let time = board::now();
        node.on_edge(time, pin.is_high());
    }
}
