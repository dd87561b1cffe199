// FluxPulse firmware: sensorless FOC on the STM32G431 board.
//
// TIM2 update events arrive at both ends of the center aligned period. One end starts the
// ADC1 DMA sequence, the other runs the controller tick on the finished buffer and commits
// the new duties. The idle task walks the bring-up sequence through the command queue and
// logs the controller state.

// Licensed under the Apache License, Version 2.0
// Copyright 2024 Anton Khrustalev, creapunk.com

#![no_main]
#![no_std]

use defmt_rtt as _;
use panic_probe as _;

use hal::{
    self,
    adc::{Adc, AdcDevice, AdcInterrupt, Align, InputType, SampleTime},
    clocks::Clocks,
    dma,
    dma::{Dma, DmaChannel, DmaInput, DmaInterrupt, DmaPeriph},
    gpio::Pin,
    pac,
    pac::{ADC1, DMA1},
    timer::TimerInterrupt,
};

use fluxpulse_algo::{
    math_float::units::kv_to_flux_linkage, Command, CommandConsumer, CommandProducer,
    CommandQueue, Config, MotorController, Snapshot, State,
};
use fluxpulse_drivers::{
    analog::{AnalogScale, Channels},
    pinout,
    pwm::TimPWM,
};

const CONTROL_FREQ: f32 = 30_000.0;
const QUEUE_SIZE: usize = 8;
const TELEMETRY_DIVIDER: u32 = 300; // Snapshot every 10 ms
const IDLE_POLL_CYCLES: u32 = 85_000_000; // About 0.5 s at 170 MHz

const POLE_PAIRS: f32 = 7.0;
const MOTOR_KV: f32 = 330.0;

/// Bring-up steps, one per return to IDLE. The speed setpoint is 3000 rpm.
const SEQUENCE: [Command; 7] = [
    Command::Request(State::ZeroDrift),
    Command::Request(State::PowerStageTest),
    Command::Request(State::AdjustCurrent),
    Command::Request(State::ProbeConstR),
    Command::Request(State::ProbeConstL),
    Command::Request(State::LuInitiate),
    Command::SpeedSetpoint(2199.1),
];

static mut ADC_READ_BUF: [u16; Channels::COUNT] = [0; Channels::COUNT];

#[rtic::app(device = pac, peripherals = true)]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        snapshot: Snapshot,
    }

    #[local]
    struct Local {
        motor: MotorController<TimPWM>,
        commands: CommandConsumer<'static, QUEUE_SIZE>,
        host: CommandProducer<'static, QUEUE_SIZE>,
        scale: AnalogScale,
        underflow: bool,
        adc1: Adc<ADC1>,
        dma1: Dma<DMA1>,
        red: Pin,
    }

    #[init(local = [queue: CommandQueue<QUEUE_SIZE> = CommandQueue::new()])]
    fn init(ctx: init::Context) -> (Shared, Local) {
        let dp = ctx.device;
        let clock_cfg = Clocks::default();
        if clock_cfg.setup().is_err() {
            defmt::panic!("SYSTEM: Clock setup failed");
        }
        defmt::debug!("SYSTEM: Clock frequency is {} MHz", clock_cfg.sysclk() / 1000000);
        init_driver_pins();

        // Two update events per control period
        let mut pwm = TimPWM::new(dp.TIM2, &clock_cfg, 2.0 * CONTROL_FREQ);
        pwm.begin();

        let mut cfg = Config::new(CONTROL_FREQ, pwm.resolution());
        cfg.motor.zp = POLE_PAIRS;
        cfg.motor.e = kv_to_flux_linkage(MOTOR_KV, POLE_PAIRS);
        // Starting point for the inductance probe
        cfg.motor.ld = 20e-6;
        cfg.motor.lq = 20e-6;

        let motor = MotorController::new(pwm, cfg);
        let snapshot = motor.snapshot();
        let (host, commands) = ctx.local.queue.split();

        let dma1 = Dma::new(dp.DMA1);
        dma::enable_mux1();
        dma::mux(DmaPeriph::Dma1, DmaChannel::C1, DmaInput::Adc1);

        let mut adc1 = Adc::new_adc1(
            dp.ADC1,
            AdcDevice::One,
            Default::default(),
            clock_cfg.systick(),
        );

        let sequence = pinout::analog::ADC1_SEQUENCE;
        for (i, channel) in sequence.iter().enumerate() {
            adc1.set_sequence(*channel, i as u8 + 1);
            adc1.set_input_type(*channel, InputType::SingleEnded);
            adc1.set_sample_time(*channel, SampleTime::T2);
        }
        adc1.set_sequence_len(sequence.len() as u8);
        adc1.set_align(Align::Left);
        adc1.enable_interrupt(AdcInterrupt::EndOfSequence);

        // 3.3 V reference, 2 mOhm shunts behind a x20 amplifier, 1:21 dividers
        let scale = AnalogScale::new(3.3, 2e-3, 20.0, 21.0);

        (
            Shared { snapshot },
            Local {
                motor,
                commands,
                host,
                scale,
                underflow: true,
                adc1,
                dma1,
                red: pinout::led::RED.init(),
            },
        )
    }

    fn init_driver_pins() {
        let mut dr_reset = pinout::driver::RESET.init();
        dr_reset.set_high();

        for pin in [
            &pinout::analog::CURRENT_A,
            &pinout::analog::CURRENT_B,
            &pinout::analog::SUPPLY,
            &pinout::analog::VOLTAGE_A,
            &pinout::analog::VOLTAGE_B,
            &pinout::analog::VOLTAGE_C,
        ] {
            pin.init();
        }
    }

    #[task(binds = TIM2, shared = [snapshot], local = [motor, commands, scale, underflow, adc1])]
    fn tim2_period_elapsed(mut cx: tim2_period_elapsed::Context) {
        let motor = cx.local.motor;
        motor
            .power_stage_mut()
            .get_timer()
            .clear_interrupt(TimerInterrupt::Update);

        *cx.local.underflow = !*cx.local.underflow;

        if *cx.local.underflow {
            let buf = unsafe { ADC_READ_BUF };
            let raw = cx.local.scale.samples(&buf);
            motor.tick(&raw, cx.local.commands);

            if motor.ticks() % TELEMETRY_DIVIDER == 0 {
                let snapshot = motor.snapshot();
                cx.shared.snapshot.lock(|s| *s = snapshot);
            }
        } else {
            unsafe {
                cx.local.adc1.read_dma(
                    &mut ADC_READ_BUF,
                    &pinout::analog::ADC1_SEQUENCE,
                    DmaChannel::C1,
                    Default::default(),
                    DmaPeriph::Dma1,
                )
            };
        }
    }

    #[task(binds = DMA1_CH1, local = [dma1], priority = 1)]
    fn adc_end_read(cx: adc_end_read::Context) {
        dma::clear_interrupt(
            DmaPeriph::Dma1,
            DmaChannel::C1,
            DmaInterrupt::TransferComplete,
        );
        cx.local.dma1.stop(DmaChannel::C1);
    }

    #[idle(shared = [snapshot], local = [host, red, step: usize = 0])]
    fn idle(mut cx: idle::Context) -> ! {
        loop {
            cortex_m::asm::delay(IDLE_POLL_CYCLES);
            let s = cx.shared.snapshot.lock(|s| *s);
            defmt::info!(
                "STATUS: {} {} {} speed {} rad/s supply {} V",
                s.state,
                s.phase,
                s.region,
                s.speed,
                s.supply
            );

            if s.fault != 0 {
                cx.local.red.set_high();
                continue;
            }

            if s.state == State::Idle {
                if let Some(command) = SEQUENCE.get(*cx.local.step) {
                    if cx.local.host.enqueue(*command).is_ok() {
                        *cx.local.step += 1;
                    }
                }
            }
        }
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
