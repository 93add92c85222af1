// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding: a host session wired to a simulated device over
//! the in-memory pipe, plus a link wrapper that fragments transfers.

#![allow(dead_code)]

use std::io;
use std::thread::JoinHandle;

use memlink_host::pipe::{self, PipeLink};
use memlink_host::{Link, Session, SimDevice};
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A session against a default simulated device.
pub fn start() -> (Session<PipeLink>, JoinHandle<()>) {
    start_with(|_| {})
}

/// A session against a simulated device the caller arranges first.
pub fn start_with(
    setup: impl FnOnce(&mut SimDevice<PipeLink>),
) -> (Session<PipeLink>, JoinHandle<()>) {
    init_logs();
    let (host_end, dev_end) = pipe::duplex();
    let mut dev = SimDevice::new(dev_end);
    setup(&mut dev);
    let handle = dev.spawn();
    let session = Session::open(host_end).expect("session open");
    (session, handle)
}

/// Caps every transfer at a seeded-random size, exercising the
/// driver's short-count loops with arbitrary frame fragmentation.
pub struct ChunkedLink<L> {
    inner: L,
    rng: ChaCha8Rng,
    max: usize,
}

impl<L: Link> ChunkedLink<L> {
    pub fn new(inner: L, seed: u64, max: usize) -> Self {
        assert!(max >= 1);
        Self {
            inner,
            rng: ChaCha8Rng::seed_from_u64(seed),
            max,
        }
    }
}

impl<L: Link> Link for ChunkedLink<L> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.read(buf);
        }
        let cap = self.rng.random_range(1..=self.max).min(buf.len());
        self.inner.read(&mut buf[..cap])
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return self.inner.write(buf);
        }
        let cap = self.rng.random_range(1..=self.max).min(buf.len());
        self.inner.write(&buf[..cap])
    }

    fn available(&mut self) -> io::Result<usize> {
        self.inner.available()
    }
}
