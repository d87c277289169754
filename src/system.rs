// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The process-global proxy list, generalized from the original's
//! `QLIST_HEAD` + `proxy_dev_list` statics into an explicit value an
//! embedder owns and passes around.

use std::sync::{Arc, Mutex};

use libc::pid_t;
use msg_socket::ProxyLink;

struct ProxyEntry {
    link: Arc<ProxyLink>,
    pid: pid_t,
}

/// The registry of every currently-realized proxy device. One `System` per
/// host process; the heartbeat broadcasts against whatever it currently
/// holds.
#[derive(Default)]
pub struct System {
    proxies: Mutex<Vec<ProxyEntry>>,
}

impl System {
    pub fn new() -> System {
        System { proxies: Mutex::new(Vec::new()) }
    }

    /// Publishes a realized proxy device's link under its remote pid. The
    /// caller is `ProxyDevice::realize`'s caller, not `realize` itself (see
    /// the module doc and DESIGN.md for why).
    pub fn register(&self, link: Arc<ProxyLink>, pid: pid_t) {
        self.proxies.lock().unwrap().push(ProxyEntry { link, pid });
    }

    /// Removes every entry for `pid`, the shutdown-path counterpart to
    /// `register`. Returns whether any proxy remains registered afterward,
    /// which decides whether the embedder should keep the heartbeat timer
    /// armed.
    pub fn unregister(&self, pid: pid_t) -> bool {
        let mut proxies = self.proxies.lock().unwrap();
        proxies.retain(|entry| entry.pid != pid);
        !proxies.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    /// A snapshot of every currently-registered link, in registration
    /// order — the order `Heartbeat::tick` broadcasts in.
    pub(crate) fn links(&self) -> Vec<Arc<ProxyLink>> {
        self.proxies.lock().unwrap().iter().map(|entry| entry.link.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn fresh_link() -> Arc<ProxyLink> {
        let (a, _b) = UnixStream::pair().unwrap();
        Arc::new(ProxyLink::new(a.into_raw_fd()))
    }

    #[test]
    fn register_then_unregister_empties_the_list() {
        let system = System::new();
        system.register(fresh_link(), 42);
        assert_eq!(system.len(), 1);
        assert!(!system.unregister(42));
        assert!(system.is_empty());
    }

    #[test]
    fn unregister_only_removes_the_matching_pid() {
        let system = System::new();
        system.register(fresh_link(), 1);
        system.register(fresh_link(), 2);
        assert!(system.unregister(1));
        assert_eq!(system.len(), 1);
    }
}
