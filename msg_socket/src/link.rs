// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The proxy link: a connected socket plus an event loop built on the same
//! `PollContext`/`Token`/`iter_readable`/`iter_hungup` pattern this
//! workspace's other socket loops use, here driving the proxy wire frame
//! instead of a request/response over a control socket.
//!
//! Send is serialized by a mutex so a header+fds `sendmsg` and its optional
//! `data2` `sendmsg` never interleave with another sender's. Recv is only
//! ever called from the single reader thread that runs `start_handler`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

use sys_util::{PollContext, PollToken};

use crate::error::Result;
use crate::wire::{self, Message};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Token {
    Sock,
}

impl PollToken for Token {
    fn as_raw_token(&self) -> u64 {
        0
    }
    fn from_raw_token(_data: u64) -> Self {
        Token::Sock
    }
}

/// Why the callback was invoked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The socket has data to read. The callback is expected to call
    /// [`ProxyLink::recv`] exactly once.
    Readable,
    /// The socket hung up or errored. The loop stops after this callback
    /// invocation regardless of its return value.
    HungUp,
}

/// A connected, fd-passing socket plus the event loop that drives it.
pub struct ProxyLink {
    sock: RawFd,
    send_lock: Mutex<()>,
}

impl ProxyLink {
    /// Wraps an already-connected socket fd. Ownership of `sock` moves in;
    /// `ProxyLink`'s `Drop` closes it.
    pub fn new(sock: RawFd) -> ProxyLink {
        ProxyLink { sock, send_lock: Mutex::new(()) }
    }

    /// Thread-safe, blocking send. May be called from any thread. Takes
    /// `msg` by value: `wire::send` owns closing any wait-object fds it
    /// carries once the sendmsg calls complete.
    pub fn send(&self, msg: Message) -> Result<()> {
        let _guard = self.send_lock.lock().unwrap();
        wire::send(self.sock, msg)
    }

    /// Receives one message. Must only be called from the callback running
    /// on the reader thread (i.e. from inside `start_handler`'s loop).
    pub fn recv(&self) -> Result<Message> {
        wire::recv(self.sock)
    }

    /// Runs the event loop on the calling thread until the callback returns
    /// `false` for a [`LinkEvent::HungUp`] or the socket is hung up with no
    /// callback installed. Blocks the calling thread for as long as the loop
    /// runs.
    pub fn start_handler(
        &self,
        mut callback: impl FnMut(&ProxyLink, LinkEvent) -> bool,
    ) -> Result<()> {
        let poll_ctx: PollContext<Token> = PollContext::new()?;
        poll_ctx.add(self, Token::Sock)?;

        'poll: loop {
            let events = poll_ctx.wait()?;
            // A socket can be readable and hung-up in the same event (the
            // peer closed after writing); drain readability first so no
            // buffered message is dropped before the loop stops.
            let mut stop = false;
            for event in events.iter_readable() {
                let _ = event.token();
                if !callback(self, LinkEvent::Readable) {
                    stop = true;
                }
            }
            for event in events.iter_hungup() {
                let _ = event.token();
                callback(self, LinkEvent::HungUp);
                stop = true;
            }
            if stop {
                break 'poll;
            }
        }
        Ok(())
    }

    /// Tears down the link, closing the socket.
    pub fn finalize(self) {
        drop(self)
    }
}

impl AsRawFd for ProxyLink {
    fn as_raw_fd(&self) -> RawFd {
        self.sock
    }
}

impl Drop for ProxyLink {
    fn drop(&mut self) {
        // SAFETY: `sock` is only ever owned by one ProxyLink.
        unsafe {
            libc::close(self.sock);
        }
    }
}
