// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session verbs against a simulated device over the in-memory pipe.

mod common;

use std::sync::{Arc, Mutex};

use common::{start, start_with, ChunkedLink};
use memlink_host::{
    layout, pipe, with_version, Error, FifoId, Op, Session, SimDevice,
};

#[test]
fn open_handshake_records_the_pid() {
    let (session, dev) = start();
    assert_eq!(session.pid(), layout::MEM_PID);
    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn open_rejects_a_wrong_version() {
    common::init_logs();
    let (host_end, dev_end) = pipe::duplex();
    let dev = with_version(dev_end, 0x2001_0101).spawn();

    let err = Session::open(host_end).err().expect("open must fail");
    match err {
        Error::VersionMismatch { device, host } => {
            assert_eq!(device, 0x2001_0101);
            assert_eq!(host, layout::MEM_VERSION);
        }
        e => panic!("unexpected error: {e}"),
    }
    dev.join().unwrap();
}

#[test]
fn gpio_led_and_adc_verbs() {
    let (session, dev) = start_with(|d| {
        let regs = d.mem_mut().regs_mut();
        regs.gpio_in = 0x5A;
        regs.adc1.set(0x123);
        regs.adc2.set(0x456);
    });

    session.led_set(true).unwrap();
    session.gpio_write(0xA5).unwrap();
    assert_eq!(session.gpio_read().unwrap(), 0x5A);
    assert_eq!(session.adc_read().unwrap(), (0x123, 0x456));

    let regs = session.registers().unwrap();
    assert_eq!(regs.led, 1);
    assert_eq!(regs.gpio_out, 0xA5);
    assert_eq!(regs.status, layout::STATUS_IDLE);

    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn completions_fire_once_each_in_request_order() {
    let (session, dev) = start();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.set_completion_observer(move |header, actual| {
        sink.lock().unwrap().push((header.op, actual));
    });

    for i in 0..20 {
        if i % 2 == 0 {
            session.delay_write(layout::LED).unwrap();
        } else {
            session.delay_read(layout::LED).unwrap();
        }
    }
    session.flush().unwrap();
    session.wait_all().unwrap();

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        for (i, (op, actual)) in seen.iter().enumerate() {
            let want = if i % 2 == 0 { Op::Write } else { Op::Read };
            assert_eq!(*op, want, "completion {i}");
            assert_eq!(*actual, 1);
        }
    }
    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn a_deep_backlog_drains_through_the_pending_ring() {
    let (session, dev) = start();
    let completions = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&completions);
    session.set_completion_observer(move |_, _| {
        *sink.lock().unwrap() += 1;
    });

    // Far more than the pending ring holds; staging must retire
    // transactions along the way.
    for _ in 0..100 {
        session.delay_read(layout::VERSION).unwrap();
    }
    session.flush().unwrap();
    session.wait_all().unwrap();

    assert_eq!(*completions.lock().unwrap(), 100);
    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn read_log_drains_the_device_ring() {
    let line = b"tick 0001: adc settled\n".repeat(20);
    let expected = line.clone();
    let (session, dev) = start_with(move |d| {
        let n = d.mem_mut().fifo_mut(FifoId::Log).write_from(&line);
        assert_eq!(n, line.len());
    });

    assert_eq!(session.read_log().unwrap(), expected);
    // A second drain finds nothing.
    assert!(session.read_log().unwrap().is_empty());

    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn device_reset_reinitializes_the_image() {
    let (session, dev) = start();
    session.gpio_write(0x77).unwrap();
    session.device_reset().unwrap();

    let regs = session.registers().unwrap();
    assert_eq!(regs.gpio_out, 0);
    assert_eq!(regs.status, layout::STATUS_IDLE);
    assert_eq!(regs.version.get(), layout::MEM_VERSION);

    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn timer_programming_lands_in_device_registers() {
    let (session, dev) = start();
    let (hz, duty) = session
        .timer_start_pwm(memlink_host::Timer::T2, 2_000.0, 0.25)
        .unwrap();
    assert!((hz - 2_000.0).abs() < 1.0);
    assert!((duty - 0.25).abs() < 1e-3);

    let regs = session.registers().unwrap();
    assert_eq!(regs.timers[1].pwm_enable, 1);
    assert_eq!(regs.timers[1].prescaler.get(), 0);
    assert_eq!(regs.timers[1].period.get(), 35_999);
    assert_eq!(regs.timers[1].pulse.get(), 8_999);

    session.timer_stop(memlink_host::Timer::T2).unwrap();
    let regs = session.registers().unwrap();
    assert_eq!(regs.timers[1].pwm_enable, 0);
    assert_eq!(regs.timers[1].irq_enable, 0);

    session.close().unwrap();
    dev.join().unwrap();
}

#[test]
fn arbitrary_link_fragmentation_is_transparent() {
    common::init_logs();
    let (host_end, dev_end) = pipe::duplex();
    let dev = SimDevice::new(dev_end).spawn();

    // Never move more than 3 bytes at a time, in seeded-random chunks.
    let link = ChunkedLink::new(host_end, 0x5EED, 3);
    let session = Session::open(link).unwrap();
    for i in 0..40u8 {
        let value = i.wrapping_mul(37).wrapping_add(11);
        session.gpio_write(value).unwrap();
        let regs = session.registers().unwrap();
        assert_eq!(regs.gpio_out, value);
    }
    session.close().unwrap();
    dev.join().unwrap();
}
