// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory duplex byte pipe implementing [`Link`].
//!
//! This is the development stand-in for a serial port: two cross-wired
//! endpoints, blocking reads, and an `available()` that reports what a
//! read would return immediately. Dropping an endpoint wakes the peer,
//! whose reads then drain and return zero.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::link::Link;

#[derive(Default)]
struct HalfState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Half {
    state: Mutex<HalfState>,
    ready: Condvar,
}

impl Half {
    fn lock(&self) -> MutexGuard<'_, HalfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of a [`duplex`] pair.
pub struct PipeLink {
    rx: Arc<Half>,
    tx: Arc<Half>,
}

/// Creates a cross-wired pair of endpoints.
pub fn duplex() -> (PipeLink, PipeLink) {
    let a = Arc::new(Half::default());
    let b = Arc::new(Half::default());
    (
        PipeLink {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
        },
        PipeLink { rx: b, tx: a },
    )
}

impl Drop for PipeLink {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Link for PipeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut st = self.rx.lock();
        while st.buf.is_empty() && !st.closed {
            st = self
                .rx
                .ready
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if st.buf.is_empty() {
            // Peer is gone and everything it sent has been drained.
            return Ok(0);
        }
        let n = buf.len().min(st.buf.len());
        for slot in &mut buf[..n] {
            *slot = st.buf.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.tx.lock();
        if st.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer endpoint dropped",
            ));
        }
        st.buf.extend(buf);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.rx.lock().buf.len())
    }
}
