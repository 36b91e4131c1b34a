use embassy_stm32::rcc::*;
use embassy_stm32::time::Hertz as TimeHertz;
use embassy_stm32::Config;

/// Core clock, also the rate of the DWT cycle counter used for pulse timestamps.
pub const SYSCLK_HZ: u32 = 168_000_000;
pub const TICKS_PER_US: u32 = SYSCLK_HZ / 1_000_000;

pub struct Board {
    pub p: embassy_stm32::Peripherals,
}

impl Board {
    pub fn init() -> Self {
        let mut config = Config::default();
        config.rcc.hse = Some(Hse {
            freq: TimeHertz(8_000_000), // 8 MHz crystal
            mode: HseMode::Oscillator,
        });
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL168,
            divp: Some(PllPDiv::DIV2), // 168 MHz
            divq: Some(PllQDiv::DIV7), // 48 MHz for USB
            divr: None,
        });
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;

        let p = embassy_stm32::init(config);

        if let Some(mut cp) = cortex_m::Peripherals::take() {
            cp.DCB.enable_trace();
            cp.DWT.enable_cycle_counter();
        }

        Self { p }
    }
}

/// Free-running 32-bit timestamp at `SYSCLK_HZ`. Wraps every ~25 s.
pub fn now() -> lighthouse_tracker::Timestamp {
    lighthouse_tracker::Timestamp(cortex_m::peripheral::DWT::cycle_count())
}
