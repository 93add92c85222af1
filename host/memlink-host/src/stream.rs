// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming orchestration: keeping a bounded device ring fed (GPIO
//! out) or drained (ADC in) while a hardware timer consumes or fills
//! it at a fixed rate.
//!
//! The GPIO direction is flow-controlled by two remote counters:
//! `gpio_count` (samples still owed, decremented by the device tick)
//! and `gpio_underflow` (ticks that found the ring empty). The host
//! pushes exactly as many bytes as fit in flight, so the device ring
//! can never overflow, and a non-zero underflow counter means the host
//! lost the timing race, which kills the run.

use std::thread;
use std::time::Duration;

use log::debug;
use memlink_core::layout;
use memlink_core::{FifoId, Span};
use memlink_proto::{Op, MAX_DATA_LEN};

use crate::error::{Error, Result};
use crate::link::Link;
use crate::session::Inner;
use crate::timer::{TickParams, Timer};

/// Refill cadence while the device is consuming.
const REFILL_PAUSE: Duration = Duration::from_millis(1);

/// Poll cadence while waiting for the tail of a run to drain.
const DRAIN_PAUSE: Duration = Duration::from_millis(10);

impl<L: Link> Inner<L> {
    pub(crate) fn gpio_stream(
        &mut self,
        params: TickParams,
        samples: &[u8],
    ) -> Result<f64> {
        let total = samples.len();
        let counters =
            Span::between(layout::GPIO_COUNT, layout::GPIO_UNDERFLOW);

        // Clear the remote counters and both copies of the data ring.
        {
            let regs = self.mem.regs_mut();
            regs.gpio_count.set(0);
            regs.gpio_underflow.set(0);
        }
        self.write_span(counters)?;
        self.control_blocking(Op::ResetFifo, Some(FifoId::Data0))?;
        self.mem.fifo_mut(FifoId::Data0).clear();

        let realized = self.start_tick(Timer::T1, params)?;
        debug!(
            "gpio stream: {} samples at {:.3} kHz",
            total,
            realized / 1e3
        );

        // Preload: pack the mirror, then push until the remote ring is
        // full. `written` counts bytes handed to the mirror; they are
        // in flight until the device consumes them.
        let mut written = self.mem.fifo_mut(FifoId::Data0).write_from(samples);
        while !self.mem.fifo(FifoId::Data0).is_empty() {
            self.delay_write_fifo(FifoId::Data0, MAX_DATA_LEN)?;
            self.flush()?;
        }

        // Arm the run: the device starts consuming once it learns the
        // total.
        self.mem.regs_mut().gpio_count.set(total as u32);
        self.write_span(layout::GPIO_COUNT)?;

        // Refill until every sample has been handed over.
        while written < total {
            let owed = self.mem.regs().gpio_count.get() as usize;
            let consumed = total - owed;
            let capacity = self.mem.fifo(FifoId::Data0).len() - 1;
            // In flight = written - consumed; push only what keeps the
            // remote ring from overflowing.
            let room = (capacity + consumed).saturating_sub(written);
            let n = room.min(total - written);
            if n > 0 {
                debug!("gpio stream: [{consumed}/{total}] push {n}");
                written += self
                    .mem
                    .fifo_mut(FifoId::Data0)
                    .write_from(&samples[written..written + n]);
                while !self.mem.fifo(FifoId::Data0).is_empty() {
                    self.delay_write_fifo(FifoId::Data0, MAX_DATA_LEN)?;
                }
            }
            self.delay_read(counters)?;
            self.flush()?;
            thread::sleep(REFILL_PAUSE);
            self.check_underflow()?;
        }

        // Drain: wait for the device to finish the tail.
        loop {
            self.read_span(counters)?;
            self.check_underflow()?;
            if self.mem.regs().gpio_count.get() == 0 {
                return Ok(realized);
            }
            thread::sleep(DRAIN_PAUSE);
        }
    }

    fn check_underflow(&self) -> Result<()> {
        let lost = self.mem.regs().gpio_underflow.get();
        if lost == 0 {
            Ok(())
        } else {
            Err(Error::Underflow { lost })
        }
    }

    pub(crate) fn adc_stream(
        &mut self,
        params: TickParams,
        count: usize,
    ) -> Result<Vec<u16>> {
        // Start from an empty ring on both ends.
        self.control_blocking(Op::ResetFifo, Some(FifoId::Data1))?;
        self.mem.fifo_mut(FifoId::Data1).clear();

        let realized = self.start_tick(Timer::T2, params)?;
        debug!(
            "adc stream: {} samples at {:.3} kHz",
            count,
            realized / 1e3
        );

        let want = count * 2;
        let mut bytes = Vec::with_capacity(want + MAX_DATA_LEN as usize);
        while bytes.len() < want {
            self.delay_read_fifo(FifoId::Data1, MAX_DATA_LEN)?;
            self.flush()?;
            self.wait_all()?;

            let mirror = self.mem.fifo_mut(FifoId::Data1);
            let got = mirror.count();
            if got == 0 {
                thread::sleep(REFILL_PAUSE);
                continue;
            }
            let start = bytes.len();
            bytes.resize(start + got, 0);
            mirror.read_into(&mut bytes[start..]);
        }

        // Stop the tick and leave the ring clean on both ends. A torn
        // trailing byte from the shutdown race is discarded with the
        // rest of the excess.
        self.stop_timer(Timer::T2)?;
        self.control_blocking(Op::ClearFifo, Some(FifoId::Data1))?;
        self.mem.fifo_mut(FifoId::Data1).clear();

        bytes.truncate(want);
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}
