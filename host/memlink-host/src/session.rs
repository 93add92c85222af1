// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host end of the link: an owned session value wrapping the image,
//! the pending queue, and the transport, with a mutex around every
//! public verb.
//!
//! The driver inside is single-threaded and cooperative. Verbs stage
//! *delayed* transactions into the outbound ring; `flush` pushes them
//! to the wire and opportunistically services whatever has already come
//! back; `wait_all` blocks until every outstanding transaction has been
//! answered. The only suspension points are the blocking link calls
//! inside `flush`/`wait_one`/`wait_all` (and the streaming sleeps).

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use memlink_core::layout::{self, Registers};
use memlink_core::{
    push_plain, push_write, push_write_fifo, FifoId, Hooks, Outcome,
    PendingQueue, SharedMem, Span,
};
use memlink_proto::{Header, Op, MAX_DATA_LEN};

use crate::error::{Error, Result};
use crate::link::Link;
use crate::timer::{self, PwmParams, TickParams, Timer};

type CompletionFn = Box<dyn FnMut(&Header, u8) + Send>;

/// Adapts the session's completion observer to the core hook trait.
struct Completions<'a> {
    cb: Option<&'a mut (dyn FnMut(&Header, u8) + Send + 'static)>,
}

impl Hooks for Completions<'_> {
    fn complete(&mut self, header: &Header, actual: u8) {
        if let Some(cb) = self.cb.as_mut() {
            cb(header, actual);
        }
    }
}

pub(crate) struct Inner<L: Link> {
    pub(crate) mem: SharedMem,
    pub(crate) pending: PendingQueue,
    pub(crate) link: L,
    on_complete: Option<CompletionFn>,
    poisoned: bool,
}

impl<L: Link> Inner<L> {
    fn new(link: L) -> Self {
        Self {
            mem: SharedMem::new(),
            pending: PendingQueue::new(),
            link,
            on_complete: None,
            poisoned: false,
        }
    }

    /// Runs the handler over everything already buffered inbound.
    fn handle_all(&mut self) -> Result<()> {
        let mut hooks = Completions {
            cb: self.on_complete.as_deref_mut(),
        };
        memlink_core::try_handle_all(
            &mut self.mem,
            &mut self.pending,
            &mut hooks,
        )?;
        Ok(())
    }

    /// One handler step.
    fn step(&mut self) -> Result<Outcome> {
        let mut hooks = Completions {
            cb: self.on_complete.as_deref_mut(),
        };
        Ok(memlink_core::try_handle_one(
            &mut self.mem,
            &mut self.pending,
            &mut hooks,
        )?)
    }

    /// Drains the outbound ring into the link completely.
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

    /// Writes outbound bytes until the ring has `free` bytes of room.
    fn pump_out_until(&mut self, free: usize) -> Result<()> {
        while self.mem.fifo(FifoId::Tx).remain() < free {
            let n = self.link.write(self.mem.fifo(FifoId::Tx).read_grant())?;
            if n == 0 {
                return Err(Error::LinkClosed);
            }
            self.mem.fifo_mut(FifoId::Tx).commit_read(n);
        }
        Ok(())
    }

    /// Blocks until the inbound ring holds at least `want` bytes.
    fn pull_until(&mut self, want: usize) -> Result<()> {
        debug_assert!(want < self.mem.fifo(FifoId::Rx).len() - 1);
        while self.mem.fifo(FifoId::Rx).count() < want {
            let n =
                self.link.read(self.mem.fifo_mut(FifoId::Rx).write_grant())?;
            if n == 0 {
                return Err(Error::LinkClosed);
            }
            self.mem.fifo_mut(FifoId::Rx).commit_write(n);
        }
        Ok(())
    }

    /// Pulls in whatever the link already has buffered, without
    /// blocking past it.
    fn pull_available(&mut self) -> Result<()> {
        let avail = self.link.available()?;
        let rx = self.mem.fifo(FifoId::Rx);
        let want = (avail + rx.count()).min(rx.len() - 2);
        self.pull_until(want)
    }

    /// Drains the outbound ring, then services everything that has
    /// already arrived.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.pump_out()?;
        self.pull_available()?;
        self.handle_all()
    }

    /// Blocks until one more transaction is retired (or there is
    /// nothing left to wait for).
    pub(crate) fn wait_one(&mut self) -> Result<()> {
        self.pump_out()?;
        if self.mem.fifo(FifoId::Rx).is_empty() && !self.pending.is_empty() {
            self.pull_until(1)?;
        }
        loop {
            match self.step()? {
                Outcome::Handled => return Ok(()),
                Outcome::Idle => {
                    if self.pending.is_empty() {
                        return Ok(());
                    }
                    let want = self.mem.fifo(FifoId::Rx).count() + 1;
                    self.pull_until(want)?;
                }
                Outcome::NeedRx(want) => self.pull_until(want)?,
                Outcome::NeedTx(free) => self.pump_out_until(free)?,
            }
        }
    }

    /// Blocks until the pending queue drains.
    pub(crate) fn wait_all(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.wait_one()?;
        }
        Ok(())
    }

    /// Stages one request, retiring outstanding transactions as needed
    /// to make room in the pending ring and the outbound ring.
    fn push_wait(
        &mut self,
        mut push: impl FnMut(
            &mut SharedMem,
            &mut PendingQueue,
        ) -> std::result::Result<(), memlink_core::Backlog>,
    ) -> Result<()> {
        loop {
            if push(&mut self.mem, &mut self.pending).is_ok() {
                return Ok(());
            }
            self.wait_one()?;
        }
    }

    /// Stages READ transactions covering `span`, splitting at the
    /// per-transaction payload limit.
    pub(crate) fn delay_read(&mut self, span: Span) -> Result<()> {
        check_span(span)?;
        for header in span_headers(Op::Read, span) {
            self.push_wait(|m, p| push_plain(m, p, header))?;
        }
        Ok(())
    }

    /// Stages WRITE transactions covering `span`, payload taken from
    /// the local image.
    pub(crate) fn delay_write(&mut self, span: Span) -> Result<()> {
        check_span(span)?;
        for header in span_headers(Op::Write, span) {
            self.push_wait(|m, p| push_write(m, p, header))?;
        }
        Ok(())
    }

    /// Stages one READ-FIFO of up to `len` bytes from the remote ring.
    pub(crate) fn delay_read_fifo(
        &mut self,
        id: FifoId,
        len: u8,
    ) -> Result<()> {
        debug_assert!((1..=MAX_DATA_LEN).contains(&len));
        let header = Header::new(Op::ReadFifo, id.descriptor_addr(), len);
        self.push_wait(|m, p| push_plain(m, p, header))
    }

    /// Stages one WRITE-FIFO of up to `len` bytes drained from the
    /// local mirror of `id`. Returns how many bytes were actually
    /// staged (clamped to the mirror's occupancy; zero stages nothing).
    pub(crate) fn delay_write_fifo(
        &mut self,
        id: FifoId,
        len: u8,
    ) -> Result<u8> {
        let len = (len as usize).min(self.mem.fifo(id).count()) as u8;
        if len == 0 {
            return Ok(0);
        }
        self.push_wait(|m, p| push_write_fifo(m, p, id, len))?;
        Ok(len)
    }

    pub(crate) fn delay_control(
        &mut self,
        op: Op,
        id: Option<FifoId>,
    ) -> Result<()> {
        let addr = id.map(FifoId::descriptor_addr).unwrap_or(0);
        let header = Header::new(op, addr, 0);
        self.push_wait(|m, p| push_plain(m, p, header))
    }

    /// delay + flush + wait: the blocking composition of a span read.
    pub(crate) fn read_span(&mut self, span: Span) -> Result<()> {
        self.delay_read(span)?;
        self.flush()?;
        self.wait_all()
    }

    /// delay + flush + wait: the blocking composition of a span write.
    pub(crate) fn write_span(&mut self, span: Span) -> Result<()> {
        self.delay_write(span)?;
        self.flush()?;
        self.wait_all()
    }

    pub(crate) fn control_blocking(
        &mut self,
        op: Op,
        id: Option<FifoId>,
    ) -> Result<()> {
        self.delay_control(op, id)?;
        self.flush()?;
        self.wait_all()
    }

    /// Programs a timer's tick interrupt and enables it.
    pub(crate) fn start_tick(
        &mut self,
        timer: Timer,
        p: TickParams,
    ) -> Result<f64> {
        let t = timer.index();
        {
            let regs = &mut self.mem.regs_mut().timers[t];
            regs.prescaler.set(p.prescaler);
            regs.period.set(p.period);
        }
        self.write_span(Span::between(
            layout::timer_prescaler(t),
            layout::timer_period(t),
        ))?;
        self.mem.regs_mut().timers[t].irq_enable = 1;
        self.write_span(layout::timer_irq_enable(t))?;
        Ok(p.realized_hz)
    }

    /// Programs a timer's PWM shape and enables the output.
    pub(crate) fn start_pwm(
        &mut self,
        timer: Timer,
        p: PwmParams,
    ) -> Result<(f64, f64)> {
        let t = timer.index();
        {
            let regs = &mut self.mem.regs_mut().timers[t];
            regs.prescaler.set(p.prescaler);
            regs.period.set(p.period);
            regs.pulse.set(p.pulse);
        }
        self.write_span(Span::between(
            layout::timer_prescaler(t),
            layout::timer_pulse(t),
        ))?;
        self.mem.regs_mut().timers[t].pwm_enable = 1;
        self.write_span(layout::timer_pwm_enable(t))?;
        Ok((p.realized_hz, p.realized_duty))
    }

    /// Disables both functions of a timer.
    pub(crate) fn stop_timer(&mut self, timer: Timer) -> Result<()> {
        let t = timer.index();
        {
            let regs = &mut self.mem.regs_mut().timers[t];
            regs.pwm_enable = 0;
            regs.irq_enable = 0;
        }
        self.write_span(Span::between(
            layout::timer_pwm_enable(t),
            layout::timer_irq_enable(t),
        ))
    }
}

/// Rejects spans that leave the shared image before anything reaches
/// the wire.
fn check_span(span: Span) -> Result<()> {
    if span.addr as usize + span.len as usize > layout::MEM_SIZE {
        return Err(Error::Invalid("span outside the shared image"));
    }
    Ok(())
}

/// Splits a span into per-transaction request headers.
fn span_headers(op: Op, span: Span) -> impl Iterator<Item = Header> {
    let mut off = 0;
    std::iter::from_fn(move || {
        if off >= span.len {
            return None;
        }
        let len = (span.len - off).min(u32::from(MAX_DATA_LEN)) as u8;
        let header = Header::new(op, span.addr + off, len);
        off += u32::from(len);
        Some(header)
    })
}

/// A host session over one transport.
///
/// All verbs take `&self`; an internal mutex serializes concurrent
/// callers, and the driver may block on the link inside the critical
/// section. A protocol violation poisons the session permanently.
pub struct Session<L: Link> {
    inner: Mutex<Inner<L>>,
    pid: u16,
}

impl<L: Link> Session<L> {
    /// Opens a session: binds the image, then performs the handshake
    /// (version must match, image size must match, pid is recorded).
    pub fn open(link: L) -> Result<Self> {
        let mut inner = Inner::new(link);

        inner.read_span(layout::VERSION)?;
        let device = inner.mem.regs().version.get();
        if device != layout::MEM_VERSION {
            return Err(Error::VersionMismatch {
                device,
                host: layout::MEM_VERSION,
            });
        }

        inner.read_span(layout::SIZE)?;
        let device_size = inner.mem.regs().size.get();
        if device_size != layout::MEM_SIZE as u32 {
            return Err(Error::SizeMismatch {
                device: device_size,
                host: layout::MEM_SIZE as u32,
            });
        }

        inner.read_span(layout::PID)?;
        let pid = inner.mem.regs().pid.get();
        info!(
            "device open: version {:#010x}, pid {:#06x}, image {} bytes",
            device, pid, device_size
        );
        Ok(Self {
            inner: Mutex::new(inner),
            pid,
        })
    }

    /// The product id the device reported at open.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Installs an observer invoked as each transaction completes, with
    /// the request header and the length the responder reported.
    pub fn set_completion_observer<F>(&self, observer: F)
    where
        F: FnMut(&Header, u8) + Send + 'static,
    {
        self.lock().on_complete = Some(Box::new(observer));
    }

    /// Waits out anything still pending and releases the transport.
    pub fn close(self) -> Result<()> {
        let mut inner = self
            .inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if !inner.poisoned {
            inner.wait_all()?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&mut Inner<L>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        if inner.poisoned {
            return Err(Error::Poisoned);
        }
        let result = f(&mut inner);
        if let Err(Error::Protocol(e)) = &result {
            debug!("session poisoned: {e}");
            inner.poisoned = true;
        }
        result
    }

    /// Stages a read of `span` without flushing.
    pub fn delay_read(&self, span: Span) -> Result<()> {
        self.with(|inner| inner.delay_read(span))
    }

    /// Stages a write of `span` (from the local image) without
    /// flushing.
    pub fn delay_write(&self, span: Span) -> Result<()> {
        self.with(|inner| inner.delay_write(span))
    }

    /// Pushes staged transactions to the wire and services whatever
    /// responses are already in.
    pub fn flush(&self) -> Result<()> {
        self.with(Inner::flush)
    }

    /// Blocks until every staged transaction has completed.
    pub fn wait_all(&self) -> Result<()> {
        self.with(Inner::wait_all)
    }

    /// Blocking read of `span` into the local image.
    pub fn read_span(&self, span: Span) -> Result<()> {
        self.with(|inner| inner.read_span(span))
    }

    /// Blocking read of `span`, returning the fetched bytes.
    pub fn read_bytes(&self, span: Span) -> Result<Vec<u8>> {
        self.with(|inner| {
            inner.read_span(span)?;
            let mut out = vec![0; span.len as usize];
            inner.mem.read_bytes(span.addr, &mut out);
            Ok(out)
        })
    }

    /// Blocking fetch of the whole register block.
    pub fn registers(&self) -> Result<Registers> {
        self.with(|inner| {
            inner.read_span(Span::new(0, layout::REG_SIZE))?;
            Ok(*inner.mem.regs())
        })
    }

    pub fn led_set(&self, on: bool) -> Result<()> {
        self.with(|inner| {
            inner.mem.regs_mut().led = on as u8;
            inner.write_span(layout::LED)
        })
    }

    pub fn gpio_write(&self, value: u8) -> Result<()> {
        self.with(|inner| {
            inner.mem.regs_mut().gpio_out = value;
            inner.write_span(layout::GPIO_OUT)
        })
    }

    pub fn gpio_read(&self) -> Result<u8> {
        self.with(|inner| {
            inner.read_span(layout::GPIO_IN)?;
            Ok(inner.mem.regs().gpio_in)
        })
    }

    /// Fetches both ADC sample registers in one transaction.
    pub fn adc_read(&self) -> Result<(u16, u16)> {
        self.with(|inner| {
            inner.read_span(Span::between(layout::ADC1, layout::ADC2))?;
            let regs = inner.mem.regs();
            Ok((regs.adc1.get(), regs.adc2.get()))
        })
    }

    /// Sets the device's verbosity threshold.
    pub fn set_verbose(&self, level: u8) -> Result<()> {
        self.with(|inner| {
            inner.mem.regs_mut().verbose = level;
            inner.write_span(layout::VERBOSE)
        })
    }

    /// Asks the device to reset itself.
    pub fn device_reset(&self) -> Result<()> {
        self.with(|inner| inner.control_blocking(Op::DeviceReset, None))
    }

    /// Folds `extra` samples into an in-progress streaming budget. The
    /// device adds atomically and zeroes the staging register.
    pub fn gpio_count_add(&self, extra: u32) -> Result<()> {
        self.with(|inner| {
            inner.mem.regs_mut().gpio_count_add.set(extra);
            inner.write_span(layout::GPIO_COUNT_ADD)
        })
    }

    /// Drains the device's debug log ring.
    pub fn read_log(&self) -> Result<Vec<u8>> {
        self.with(|inner| {
            let mut out = Vec::new();
            loop {
                inner.delay_read_fifo(FifoId::Log, MAX_DATA_LEN)?;
                inner.flush()?;
                inner.wait_all()?;
                let mirror = inner.mem.fifo_mut(FifoId::Log);
                let got = mirror.count();
                let start = out.len();
                out.resize(start + got, 0);
                mirror.read_into(&mut out[start..]);
                // A short delivery means the remote ring is dry.
                if got < MAX_DATA_LEN as usize {
                    return Ok(out);
                }
            }
        })
    }

    /// Programs `timer` for interrupts at `hz`; returns the realized
    /// rate.
    pub fn timer_start_it(&self, timer: Timer, hz: f64) -> Result<f64> {
        let params = timer::tick_params(hz)?;
        self.with(|inner| inner.start_tick(timer, params))
    }

    /// Programs `timer` for PWM output at `hz` with `duty` in `[0, 1]`;
    /// returns the realized rate and duty.
    pub fn timer_start_pwm(
        &self,
        timer: Timer,
        hz: f64,
        duty: f64,
    ) -> Result<(f64, f64)> {
        let params = timer::pwm_params(hz, duty)?;
        self.with(|inner| inner.start_pwm(timer, params))
    }

    /// Disables both functions of `timer`.
    pub fn timer_stop(&self, timer: Timer) -> Result<()> {
        self.with(|inner| inner.stop_timer(timer))
    }

    /// Streams `samples` out of the GPIO port at `hz` (timer 1);
    /// returns the realized rate once the device has consumed every
    /// sample.
    pub fn gpio_stream(&self, hz: f64, samples: &[u8]) -> Result<f64> {
        let params = timer::tick_params(hz)?;
        self.with(|inner| inner.gpio_stream(params, samples))
    }

    /// Acquires `count` ADC samples at `hz` (timer 2).
    pub fn adc_stream(&self, hz: f64, count: usize) -> Result<Vec<u16>> {
        let params = timer::tick_params(hz)?;
        self.with(|inner| inner.adc_stream(params, count))
    }
}
