// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process device model.
//!
//! The protocol is symmetric, so the device side is the same image and
//! handler as the host side with a different main loop around it: pump
//! responses out, block for request bytes, service everything, then run
//! the timer side effects. This is what firmware's ISRs do between
//! frames, condensed into a deterministic `tick` step so tests can
//! drive a whole streaming run without real timers.

use std::thread;

use log::debug;
use memlink_core::layout::STATUS_IDLE;
use memlink_core::{try_handle_all, FifoId, Hooks, PendingQueue, SharedMem};

use crate::error::{Error, Result};
use crate::link::Link;

/// ADC samples the sim produces when no source is installed: a ramp
/// over the 12-bit range.
fn ramp() -> impl FnMut() -> u16 + Send {
    let mut next = 0u16;
    move || {
        next = (next + 1) & 0x0FFF;
        next
    }
}

/// Resets the image back to power-on state when the host asks.
struct DeviceHooks;

impl Hooks for DeviceHooks {
    fn reset(&mut self, mem: &mut SharedMem) {
        *mem = SharedMem::new();
        mem.regs_mut().status = STATUS_IDLE;
    }
}

/// One simulated device endpoint.
pub struct SimDevice<L: Link> {
    mem: SharedMem,
    pending: PendingQueue,
    link: L,
    hooks: DeviceHooks,
    eager: bool,
    adc_source: Box<dyn FnMut() -> u16 + Send>,
}

impl<L: Link + 'static> SimDevice<L> {
    pub fn new(link: L) -> Self {
        let mut mem = SharedMem::new();
        mem.regs_mut().status = STATUS_IDLE;
        Self {
            mem,
            pending: PendingQueue::new(),
            link,
            hooks: DeviceHooks,
            eager: false,
            adc_source: Box::new(ramp()),
        }
    }

    /// Direct access to the device image, for arranging test
    /// scenarios (seeded registers, pre-filled rings, a wrong
    /// version).
    pub fn mem_mut(&mut self) -> &mut SharedMem {
        &mut self.mem
    }

    /// In eager mode the consumer outruns any host: the tick drains
    /// everything buffered and charges an underflow whenever samples
    /// are still owed but the ring is dry. Default is a polite
    /// consumer that only ever takes what has arrived.
    pub fn set_eager(&mut self, eager: bool) {
        self.eager = eager;
    }

    /// Replaces the ADC sample source.
    pub fn set_adc_source<F>(&mut self, source: F)
    where
        F: FnMut() -> u16 + Send + 'static,
    {
        self.adc_source = Box::new(source);
    }

    /// Runs the device loop on a fresh thread until the peer hangs up.
    pub fn spawn(mut self) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.run() {
                debug!("sim device stopped: {e}");
            }
        })
    }

    /// The device main loop: service until the peer goes away.
    pub fn run(&mut self) -> Result<()> {
        while self.service()? {}
        Ok(())
    }

    /// One pass of the main loop. Returns `false` when the peer has
    /// hung up and everything it sent was drained.
    pub fn service(&mut self) -> Result<bool> {
        // Answer everything already buffered before blocking.
        loop {
            let handled =
                try_handle_all(&mut self.mem, &mut self.pending, &mut self.hooks)?;
            self.pump_out()?;
            if handled == 0 {
                break;
            }
        }
        self.tick();
        self.pump_out()?;

        // Block for more work.
        let n = {
            let grant = self.mem.fifo_mut(FifoId::Rx).write_grant();
            if grant.is_empty() {
                // Inbound ring saturated; go service it instead.
                return Ok(true);
            }
            self.link.read(grant)?
        };
        if n == 0 {
            return Ok(false);
        }
        self.mem.fifo_mut(FifoId::Rx).commit_write(n);
        self.pull_available()?;

        try_handle_all(&mut self.mem, &mut self.pending, &mut self.hooks)?;
        self.tick();
        self.pump_out()?;
        Ok(true)
    }

    /// The timer side effects, run between frames.
    fn tick(&mut self) {
        self.fold_count_add();
        if self.mem.regs().timers[0].irq_enable != 0 {
            self.tick_gpio();
        }
        if self.mem.regs().timers[1].irq_enable != 0 {
            self.tick_adc();
        }
    }

    /// Applies a pending `gpio_count_add` increment.
    fn fold_count_add(&mut self) {
        let regs = self.mem.regs_mut();
        let add = regs.gpio_count_add.get();
        if add != 0 {
            let count = regs.gpio_count.get();
            regs.gpio_count.set(count.wrapping_add(add));
            regs.gpio_count_add.set(0);
        }
    }

    /// Timer-1 ticks: pop one streamed byte per owed sample onto the
    /// output port.
    fn tick_gpio(&mut self) {
        while self.mem.regs().gpio_count.get() > 0 {
            match self.mem.fifo_mut(FifoId::Data0).dequeue() {
                Some(byte) => {
                    let regs = self.mem.regs_mut();
                    regs.gpio_out = byte;
                    let owed = regs.gpio_count.get();
                    regs.gpio_count.set(owed - 1);
                }
                None => {
                    if self.eager {
                        let regs = self.mem.regs_mut();
                        let lost = regs.gpio_underflow.get();
                        regs.gpio_underflow.set(lost + 1);
                    }
                    break;
                }
            }
        }
    }

    /// Timer-2 ticks: latch fresh ADC samples into the acquisition
    /// ring, two little-endian bytes each. A full ring drops samples.
    fn tick_adc(&mut self) {
        for _ in 0..Self::ADC_BATCH {
            if self.mem.fifo(FifoId::Data1).remain() < 2 {
                break;
            }
            let sample = (self.adc_source)() & 0x0FFF;
            self.mem.regs_mut().adc1.set(sample);
            self.mem
                .fifo_mut(FifoId::Data1)
                .write_from(&sample.to_le_bytes());
        }
    }

    /// Samples latched per service pass; enough to outpace the link.
    const ADC_BATCH: usize = 64;

    fn pump_out(&mut self) -> Result<()> {
        while !self.mem.fifo(FifoId::Tx).is_empty() {
            let n = self.link.write(self.mem.fifo(FifoId::Tx).read_grant())?;
            if n == 0 {
                return Err(Error::LinkClosed);
            }
            self.mem.fifo_mut(FifoId::Tx).commit_read(n);
        }
        Ok(())
    }

    fn pull_available(&mut self) -> Result<()> {
        let mut avail = self.link.available()?;
        while avail > 0 {
            let n = {
                let grant = self.mem.fifo_mut(FifoId::Rx).write_grant();
                if grant.is_empty() {
                    return Ok(());
                }
                let take = grant.len().min(avail);
                self.link.read(&mut grant[..take])?
            };
            if n == 0 {
                return Ok(());
            }
            self.mem.fifo_mut(FifoId::Rx).commit_write(n);
            avail -= n;
        }
        Ok(())
    }
}

/// Seeds a wrong-version image, for handshake tests.
pub fn with_version<L: Link + 'static>(
    link: L,
    version: u32,
) -> SimDevice<L> {
    let mut dev = SimDevice::new(link);
    dev.mem_mut().regs_mut().version.set(version);
    dev
}
