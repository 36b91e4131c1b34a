use core::fmt::Write;

use embassy_executor::task;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;

use lighthouse_tracker::{DataFrame, ObjectPosition};

use crate::usb::{UsbSerial, MAX_PACKET_SIZE};

/// Output task: streams poses and base-station data frames as text lines over USB.
#[task]
pub async fn output_task(
    mut usb_serial: UsbSerial<'static>,
    positions: Receiver<'static, CriticalSectionRawMutex, ObjectPosition, 4>,
    frames: Receiver<'static, CriticalSectionRawMutex, DataFrame, 2>,
) {
    loop {
        let mut m = heapless::String::<256>::new();
        match select(positions.receive(), frames.receive()).await {
            Either::First(p) => {
                if p.has_position() {
                    let _ = write!(
                        m,
                        "POS {} {} {} {:.4} {:.4} {:.4} {:.4} {:.4} {:.4} {:.4} {:.4}\r\n",
                        p.time.ticks(),
                        p.object_idx,
                        p.fix_level.as_str(),
                        p.pos[0],
                        p.pos[1],
                        p.pos[2],
                        p.pos_delta,
                        p.q[0],
                        p.q[1],
                        p.q[2],
                        p.q[3],
                    );
                } else {
                    let _ = write!(
                        m,
                        "POS {} {} {}\r\n",
                        p.time.ticks(),
                        p.object_idx,
                        p.fix_level.as_str()
                    );
                }
            }
            Either::Second(f) => {
                let _ = write!(m, "DATA {} {} ", f.time.ticks(), f.base_station_idx);
                for b in f.bytes.iter() {
                    let _ = write!(m, "{:02x}", b);
                }
                let _ = m.push_str("\r\n");
            }
        }

        if !usb_serial.dtr() {
            continue;
        }
        for chunk in m.as_bytes().chunks(MAX_PACKET_SIZE) {
            if usb_serial.write_packet(chunk).await.is_err() {
                break;
            }
        }
    }
}
