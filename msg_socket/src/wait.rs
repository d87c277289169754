// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The one-shot wait-object used by every request/reply command.
//!
//! `acquire()` hands back a typed `(Waiter, Notifier)` pair from one call, as
//! suggested by the redesign notes: the `Waiter` stays with the caller, the
//! `Notifier`'s raw fd is the one placed in the outgoing message's fd list
//! and reconstructed by the remote.
//!
//! This is built over a plain `pipe(2)`, not `sys_util::EventFd`. An eventfd
//! object has no notion of its last writer going away: two descriptors
//! `dup`'d from the same eventfd share one counter, and closing one of them
//! never unblocks a `read` pending on the other. A pipe's read end does not
//! have that problem — once every descriptor for the write end is closed,
//! `read` returns `0` immediately, written or not. That is exactly the
//! "remote gone" signal callers need, so the wait-object rides on a pipe
//! while `EventFd` stays reserved for irqfd/resamplefd signalling.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use byteorder::{ByteOrder, NativeEndian};

/// Held by the side that will block for a reply. Dropping a `Waiter` without
/// calling `wait` is safe: the underlying fd is simply closed.
pub struct Waiter {
    fd: RawFd,
}

/// Held by the side that will deliver the reply. `notify` consumes it so a
/// value can be written at most once.
pub struct Notifier {
    fd: RawFd,
}

/// Creates a fresh one-shot wait-object, returning the waiting half and the
/// notifying half.
pub fn acquire() -> sys_util::Result<(Waiter, Notifier)> {
    let mut fds = [-1; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe2 to fill in.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return sys_util::errno_result();
    }
    Ok((Waiter { fd: fds[0] }, Notifier { fd: fds[1] }))
}

impl Waiter {
    /// Blocks until a value is written (or the peer's copy is dropped), then
    /// consumes the wait-object. Returns `0` if the peer closed without
    /// writing: `0` is the reserved "remote gone" sentinel, so callers
    /// must not treat it as a legitimate zero reply (see DESIGN.md).
    pub fn wait(self) -> sys_util::Result<u64> {
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            // SAFETY: `buf[filled..]` is a valid write target of the given length.
            let ret = unsafe {
                libc::read(
                    self.fd,
                    buf[filled..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - filled,
                )
            };
            match ret {
                0 => return Ok(0),
                n if n < 0 => return sys_util::errno_result(),
                n => filled += n as usize,
            }
        }
        Ok(NativeEndian::read_u64(&buf))
    }
}

impl Notifier {
    /// Writes `value` to the wait-object and closes this side's copy.
    pub fn notify(self, value: u64) -> sys_util::Result<()> {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, value);
        // SAFETY: `buf` is a valid 8-byte buffer and `self.fd` is owned and open.
        let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            return sys_util::errno_result();
        }
        Ok(())
        // `self` drops here, closing the fd exactly once.
    }
}

impl AsRawFd for Waiter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // SAFETY: `fd` is only ever owned by one Waiter at a time.
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Notifier {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl FromRawFd for Notifier {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Notifier { fd }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: `fd` is only ever owned by one Notifier at a time.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn notify_then_wait() {
        let (waiter, notifier) = acquire().unwrap();
        notifier.notify(42).unwrap();
        assert_eq!(waiter.wait().unwrap(), 42);
    }

    #[test]
    fn cross_thread_roundtrip() {
        let (waiter, notifier) = acquire().unwrap();
        let handle = thread::spawn(move || notifier.notify(7).unwrap());
        assert_eq!(waiter.wait().unwrap(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn dropped_notifier_yields_zero() {
        let (waiter, notifier) = acquire().unwrap();
        drop(notifier);
        assert_eq!(waiter.wait().unwrap(), 0);
    }

    #[test]
    fn dropped_waiter_does_not_panic() {
        let (waiter, notifier) = acquire().unwrap();
        drop(waiter);
        // The peer's write lands on a pipe with no reader; EPIPE would only
        // surface as a SIGPIPE we don't install a handler for in tests, so
        // this exercises the common "reply raced a disconnect" path.
        let _ = notifier.notify(1);
    }
}
