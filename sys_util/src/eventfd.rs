// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A thin wrapper around Linux's `eventfd(2)`.
//!
//! Used for the irqfd/resamplefd pair a proxy device hands to its remote,
//! the same role `EventFd` plays for vcpu exit/IRQ signalling elsewhere in
//! the corpus.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use libc::{c_void, dup, eventfd, read, write};

use crate::errno::{errno_result, Result};

/// A safe wrapper around a Linux `eventfd`.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Creates a new `EventFd` with an initial value of 0.
    pub fn new() -> Result<EventFd> {
        // SAFETY: eventfd(2) with EFD_CLOEXEC and EFD_NONBLOCK is always safe
        // to call; we own the returned fd.
        let fd = unsafe { eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return errno_result();
        }
        Ok(EventFd { fd })
    }

    /// Adds `v` to the counter, waking up anyone blocked in `read`.
    pub fn write(&self, v: u64) -> Result<()> {
        // SAFETY: `fd` is a valid, owned eventfd and the buffer is sized for
        // exactly one u64 as eventfd(2) requires.
        let ret = unsafe {
            write(
                self.fd,
                &v as *const u64 as *const c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until the counter is non-zero, then returns it, resetting the
    /// counter to 0. Unlike a pipe, closing one descriptor dup'd from this
    /// object never unblocks a `read` pending on another: the counter is
    /// shared kernel state, not a stream with an EOF concept, so this is
    /// the wrong primitive for a "peer went away" signal (see
    /// `msg_socket::wait`, which uses a pipe for exactly that reason).
    pub fn read(&self) -> Result<u64> {
        let mut buf: u64 = 0;
        // SAFETY: same as above, reading into a correctly sized local.
        let ret = unsafe {
            read(
                self.fd,
                &mut buf as *mut u64 as *mut c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match ret {
            0 => Ok(0),
            n if n < 0 => errno_result(),
            _ => Ok(buf),
        }
    }

    /// Duplicates this event fd, returning a new `EventFd` pointing at the
    /// same kernel object.
    pub fn try_clone(&self) -> Result<EventFd> {
        // SAFETY: dup(2) of a valid fd we own.
        let ret = unsafe { dup(self.fd) };
        if ret < 0 {
            return errno_result();
        }
        Ok(EventFd { fd: ret })
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for EventFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        EventFd { fd }
    }
}

impl IntoRawFd for EventFd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: `fd` is only ever owned by one EventFd at a time.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read() {
        let evt = EventFd::new().unwrap();
        evt.write(55).unwrap();
        assert_eq!(evt.read(), Ok(55));
    }

    #[test]
    fn eventfd_clone() {
        let evt = EventFd::new().unwrap();
        let evt_clone = evt.try_clone().unwrap();
        evt.write(923).unwrap();
        assert_eq!(evt_clone.read(), Ok(923));
    }

    #[test]
    fn dropping_a_clone_does_not_affect_the_original() {
        let evt = EventFd::new().unwrap();
        let dup_fd = evt.try_clone().unwrap();
        drop(dup_fd);
        evt.write(1).unwrap();
        assert_eq!(evt.read(), Ok(1));
    }
}
