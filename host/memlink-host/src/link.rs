// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

/// A byte-stream transport, typically a serial port.
///
/// The driver tolerates arbitrarily short transfers and loops; a
/// transport only has to move at least one byte per blocking call.
/// Per-call timeouts belong to the implementation, which reports their
/// expiry (or a closed peer) by returning `Ok(0)`.
pub trait Link: Send {
    /// Blocks until at least one byte is available (or the peer is
    /// gone), then reads up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes up to `buf.len()` bytes, returning how many were taken.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes that can be read without blocking.
    fn available(&mut self) -> io::Result<usize>;
}

impl<T: Link + ?Sized> Link for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }
}
