// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small `epoll(7)` wrapper used by the proxy link's event loop: watch a
//! handful of fds, dispatch on whichever token fires.

use std::marker::PhantomData;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLL_CLOEXEC,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};

use crate::errno::{errno_result, Result};

/// Types that can be converted to and from the 64 bits of `epoll_data` carried
/// alongside each event. Implementations are normally a small `enum`,
/// written by hand at each call site since this workspace has no derive
/// macro for it.
pub trait PollToken {
    fn as_raw_token(&self) -> u64;
    fn from_raw_token(data: u64) -> Self;
}

impl PollToken for usize {
    fn as_raw_token(&self) -> u64 {
        *self as u64
    }
    fn from_raw_token(data: u64) -> Self {
        data as usize
    }
}

/// A single fd's worth of event loop registration plus polling.
pub struct PollContext<T> {
    epoll_fd: RawFd,
    token: PhantomData<T>,
}

impl<T: PollToken> PollContext<T> {
    pub fn new() -> Result<PollContext<T>> {
        // SAFETY: epoll_create1 has no preconditions; we own the returned fd.
        let epoll_fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return errno_result();
        }
        Ok(PollContext {
            epoll_fd,
            token: PhantomData,
        })
    }

    /// Registers `fd` for readability/hangup/error notifications, tagged with
    /// `token`.
    pub fn add(&self, fd: &dyn AsRawFd, token: T) -> Result<()> {
        let mut event = epoll_event {
            events: (EPOLLIN | EPOLLHUP | EPOLLERR) as u32,
            u64: token.as_raw_token(),
        };
        // SAFETY: `event` outlives the call and `epoll_fd` is valid.
        let ret = unsafe {
            epoll_ctl(
                self.epoll_fd,
                EPOLL_CTL_ADD,
                fd.as_raw_fd(),
                &mut event as *mut epoll_event,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Unregisters `fd`. Harmless to call on an fd that was already removed
    /// by the kernel (e.g. because it was closed).
    pub fn delete(&self, fd: &dyn AsRawFd) -> Result<()> {
        // SAFETY: epoll_ctl tolerates a null event pointer for EPOLL_CTL_DEL.
        let ret = unsafe {
            epoll_ctl(
                self.epoll_fd,
                EPOLL_CTL_DEL,
                fd.as_raw_fd(),
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Blocks until at least one registered fd is ready, or `timeout` elapses
    /// if given.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<PollEvents<T>> {
        let mut events: [epoll_event; 32] = unsafe { mem::zeroed() };
        let timeout_ms = timeout.map_or(-1, |d| d.as_millis() as i32);
        // SAFETY: `events` is large enough for the `events.len()` passed in.
        let ret = unsafe {
            epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(PollEvents {
            events: events[..ret as usize].to_vec(),
            token: PhantomData,
        })
    }

    pub fn wait(&self) -> Result<PollEvents<T>> {
        self.wait_timeout(None)
    }
}

impl<T> Drop for PollContext<T> {
    fn drop(&mut self) {
        // SAFETY: `epoll_fd` is only ever owned by one PollContext.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// One fd's worth of activity reported by a call to `PollContext::wait`.
pub struct TriggeredEvent<T> {
    token: T,
    readable: bool,
    hungup: bool,
}

impl<T> TriggeredEvent<T> {
    pub fn token(&self) -> &T {
        &self.token
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn hungup(&self) -> bool {
        self.hungup
    }
}

/// The set of fds that became ready in one `wait` call.
pub struct PollEvents<T> {
    events: Vec<epoll_event>,
    token: PhantomData<T>,
}

impl<T: PollToken> PollEvents<T> {
    fn triggered(&self) -> impl Iterator<Item = TriggeredEvent<T>> + '_ {
        self.events.iter().map(|e| TriggeredEvent {
            token: T::from_raw_token(e.u64),
            readable: (e.events & EPOLLIN as u32) != 0,
            hungup: (e.events & (EPOLLHUP | EPOLLERR) as u32) != 0,
        })
    }

    /// Events with data available to read (check even if also hung up: a
    /// socket may have buffered data pending after the peer closed).
    pub fn iter_readable(&self) -> impl Iterator<Item = TriggeredEvent<T>> + '_ {
        self.triggered().filter(|e| e.readable)
    }

    /// Events signalling hangup or error.
    pub fn iter_hungup(&self) -> impl Iterator<Item = TriggeredEvent<T>> + '_ {
        self.triggered().filter(|e| e.hungup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventFd;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Token {
        Fd1,
        Fd2,
    }

    impl PollToken for Token {
        fn as_raw_token(&self) -> u64 {
            match self {
                Token::Fd1 => 1,
                Token::Fd2 => 2,
            }
        }
        fn from_raw_token(data: u64) -> Self {
            match data {
                1 => Token::Fd1,
                _ => Token::Fd2,
            }
        }
    }

    #[test]
    fn poll_context_wakes_on_write() {
        let evt1 = EventFd::new().unwrap();
        let evt2 = EventFd::new().unwrap();
        let ctx: PollContext<Token> = PollContext::new().unwrap();
        ctx.add(&evt1, Token::Fd1).unwrap();
        ctx.add(&evt2, Token::Fd2).unwrap();

        evt2.write(1).unwrap();

        let events = ctx.wait().unwrap();
        let tokens: Vec<Token> = events.iter_readable().map(|e| *e.token()).collect();
        assert_eq!(tokens, vec![Token::Fd2]);
    }
}
