// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Periodic liveness probing of every registered remote, generalized from
//! `qemu-proxy.c`'s `broadcast_msg` timer callback.
//!
//! A single non-zero reply proves the host's epoll thread and the socket
//! plumbing are still alive, which is all the original ever checked for, so
//! a tick only waits on the first remote it probes; every other remote gets
//! a fire-and-forget `PROXY_PING` with no attached waiter. A remote that
//! never replies at all just never gets acknowledged — nothing in this core
//! kills a non-responsive remote on its own.

use msg_socket::{Message, ProxyLink};

use crate::system::System;

/// Matches `qemu-proxy.c`'s timer period.
pub const INTERVAL_MS: u64 = 1_000_000;

#[derive(Default)]
pub struct Heartbeat;

impl Heartbeat {
    pub fn new() -> Heartbeat {
        Heartbeat
    }

    /// Probes every link currently registered with `system`. Call this
    /// once per `INTERVAL_MS` from whatever timer the embedder runs.
    pub fn tick(&self, system: &System) {
        let mut proven_alive = false;
        for link in system.links() {
            if !proven_alive {
                match ping_and_wait(&link) {
                    Some(pid) if pid != 0 => proven_alive = true,
                    _ => warn!("heartbeat: remote did not answer PROXY_PING"),
                }
            } else {
                let _ = link.send(Message::ProxyPing { waiter: None });
            }
        }
    }
}

fn ping_and_wait(link: &ProxyLink) -> Option<u64> {
    let (waiter, notifier) = msg_socket::acquire().ok()?;
    if link.send(Message::ProxyPing { waiter: Some(notifier) }).is_err() {
        return None;
    }
    waiter.wait().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tick_against_no_remotes_is_a_no_op() {
        let system = System::new();
        Heartbeat::new().tick(&system);
    }

    #[test]
    fn tick_probes_first_remote_and_pings_the_rest() {
        let (host_a, remote_a) = UnixStream::pair().unwrap();
        let (host_b, remote_b) = UnixStream::pair().unwrap();

        let system = System::new();
        system.register(Arc::new(ProxyLink::new(host_a.into_raw_fd())), 1);
        system.register(Arc::new(ProxyLink::new(host_b.into_raw_fd())), 2);

        let remote_a_link = ProxyLink::new(remote_a.into_raw_fd());
        let handle = thread::spawn(move || match remote_a_link.recv() {
            Ok(Message::ProxyPing { waiter: Some(notifier) }) => {
                notifier.notify(4242).unwrap();
            }
            other => panic!("unexpected message: {:?}", other),
        });

        let remote_b_link = ProxyLink::new(remote_b.into_raw_fd());
        let b_handle = thread::spawn(move || match remote_b_link.recv() {
            Ok(Message::ProxyPing { waiter: None }) => {}
            other => panic!("unexpected message on second remote: {:?}", other),
        });

        Heartbeat::new().tick(&system);

        handle.join().unwrap();
        b_handle.join().unwrap();
    }
}
