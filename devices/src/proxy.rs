// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host-side half of a proxied device: a PCI config-space shim, a BAR
//! access shim, and the fork/exec plumbing that stands up the remote
//! process and its [`ProxyLink`]. Mirrors `hw/proxy/qemu-proxy.c`'s
//! `PCIProxyDev`, generalized from a `PCIDevice` subclass to a value that
//! embeds this type by composition (per the redesign note preferring
//! composition over inheritance).

use std::ffi::CString;
use std::fmt::{self, Display};
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process;
use std::ptr;
use std::sync::Arc;

use libc::pid_t;

use kvm::{Gsi, IntxInstaller, IntxRoute};
use msg_socket::{self, Message, ProxyLink};
use resources::MemorySyncListener;
use sys_util::EventFd;

use crate::pci::{PciConfiguration, PciDevice, PciInterruptPin};

#[derive(Debug)]
pub enum Error {
    /// `fork(2)` failed.
    Fork(io::Error),
    /// Creating the host/remote socket pair failed.
    Socket(io::Error),
    /// A send/recv on the link failed (transport or decode error).
    Link(msg_socket::Error),
    /// The wait-object read failed at the OS level (not the `0`-on-EOF case,
    /// which is a valid if ambiguous "remote gone" signal rather than a
    /// real OS error).
    Wait(sys_util::Error),
    /// Installing or rerouting the irqfd failed.
    Irqfd(kvm::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Fork(e) => write!(f, "failed to fork remote process: {}", e),
            Error::Socket(e) => write!(f, "failed to create proxy socket pair: {}", e),
            Error::Link(e) => write!(f, "proxy link error: {}", e),
            Error::Wait(e) => write!(f, "wait-object error: {}", e),
            Error::Irqfd(e) => write!(f, "irqfd error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<msg_socket::Error> for Error {
    fn from(e: msg_socket::Error) -> Self {
        Error::Link(e)
    }
}

impl From<sys_util::Error> for Error {
    fn from(e: sys_util::Error) -> Self {
        Error::Wait(e)
    }
}

impl From<kvm::Error> for Error {
    fn from(e: kvm::Error) -> Self {
        Error::Irqfd(e)
    }
}

/// Clears `FD_CLOEXEC` on `fd` so it survives the child's `execvp`. Every
/// other inherited fd keeps whatever close-on-exec flag it was created
/// with (`sys_util`'s primitives all set `CLOEXEC`), which is the "close
/// everything except the remote's socket end" rule from the redesign notes
/// expressed as "set nothing, rely on what's already cloexec, clear it only
/// on the one fd that must survive."
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open fd owned by the caller for the duration
    // of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same as above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Forks and execs `command` with the remote's end of a fresh socket pair
/// passed as `argv[1]` (a decimal fd number). Returns the host's end of the
/// socket and the child's pid.
fn spawn_remote(command: &str) -> Result<(RawFd, pid_t)> {
    let (host_sock, remote_sock) = UnixStream::pair().map_err(Error::Socket)?;

    // SAFETY: single-threaded-at-fork is the caller's responsibility; the
    // child only calls async-signal-safe functions (fcntl, execvp, _exit)
    // before exec.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Fork(io::Error::last_os_error()));
    }
    if pid == 0 {
        drop(host_sock);
        let remote_fd = remote_sock.into_raw_fd();
        if clear_cloexec(remote_fd).is_err() {
            process::exit(127);
        }

        let prog = match CString::new(command) {
            Ok(p) => p,
            Err(_) => process::exit(127),
        };
        let fd_arg = match CString::new(remote_fd.to_string()) {
            Ok(a) => a,
            Err(_) => process::exit(127),
        };
        let argv: [*const libc::c_char; 3] = [prog.as_ptr(), fd_arg.as_ptr(), ptr::null()];
        // SAFETY: `argv` is NUL-terminated and both CStrings outlive the call.
        unsafe {
            libc::execvp(prog.as_ptr(), argv.as_ptr());
        }
        // execvp only returns on failure.
        process::exit(127);
    }

    drop(remote_sock);
    Ok((host_sock.into_raw_fd(), pid))
}

/// Host-side façade for a device whose model lives in a remote process.
/// Owns the link, the memory-sync listener bound to it, the irqfd pair, and
/// a local shadow of config space kept coherent for capability discovery.
pub struct ProxyDevice {
    link: Arc<ProxyLink>,
    pid: pid_t,
    config: PciConfiguration,
    intx_pin: PciInterruptPin,
    intx_route: IntxRoute,
    intr: EventFd,
    resample: EventFd,
    mem_sync: MemorySyncListener,
}

impl ProxyDevice {
    /// Forks/execs the remote, runs the device-class `realize_hook` for
    /// subclass-specific setup, and binds a fresh memory-sync listener to
    /// the new link. Irqfd install happens separately in
    /// [`ProxyDevice::install_irqfd`] once the embedder has signalled the
    /// remote is ready.
    ///
    /// The caller is responsible for registering `link()`/`pid()` with
    /// whatever heartbeat/proxy-list registry it owns; this type does not
    /// reach for a process-global list itself — system state lives in an
    /// explicit value the embedder owns, not a singleton.
    pub fn realize(
        command: &str,
        config: PciConfiguration,
        intx_pin: PciInterruptPin,
        realize_hook: impl FnOnce(&ProxyLink) -> Result<()>,
    ) -> Result<ProxyDevice> {
        let (host_fd, pid) = spawn_remote(command)?;
        let link = Arc::new(ProxyLink::new(host_fd));

        realize_hook(&link)?;

        Ok(ProxyDevice {
            link,
            pid,
            config,
            intx_pin,
            intx_route: IntxRoute::new(),
            intr: EventFd::new()?,
            resample: EventFd::new()?,
            mem_sync: MemorySyncListener::new(),
        })
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn link(&self) -> &Arc<ProxyLink> {
        &self.link
    }

    pub fn mem_sync(&mut self) -> &mut MemorySyncListener {
        &mut self.mem_sync
    }

    /// Sends the memory-sync listener's accumulated sweep to the remote as
    /// one `SYNC_SYSMEM` message. Invoked by whatever drives the listener's
    /// begin/region_add/commit calls once a sweep is complete.
    pub fn commit_sysmem(&self) -> Result<()> {
        Ok(self.link.send(self.mem_sync.commit())?)
    }

    /// Allocates the `intr`/`resample` eventfd pair, sends `SET_IRQFD` with
    /// the INTx pin, and installs the route with `installer`. Called again
    /// by the embedder's intx-routing-change notifier on every route
    /// change: deassigns the previous GSI and reassigns the new one with
    /// the resample flag set, which [`IntxRoute::reroute`] already
    /// implements.
    pub fn install_irqfd(&mut self, installer: &mut dyn IntxInstaller, gsi: Gsi) -> Result<()> {
        self.link.send(Message::SetIrqfd {
            intx: self.intx_pin.to_mask() as i32,
            intr: self.intr.as_raw_fd(),
            resample: self.resample.as_raw_fd(),
        })?;
        self.intx_route.reroute(installer, &self.intr, &self.resample, gsi)?;
        Ok(())
    }

    /// Guest config-space read: consults the local shadow first (so
    /// capability discovery that only ever happens host-side stays
    /// coherent), then blocks on `CONF_READ`. Falls back to the local
    /// shadow's value if the remote is unreachable, logging the failure.
    pub fn config_read(&mut self, offset: usize, len: usize) -> u32 {
        let local = self.config.read_config(offset, len);
        match self.send_conf_read(offset, len) {
            Ok(val) => val,
            Err(e) => {
                error!("proxy config read failed, using local shadow: {}", e);
                local
            }
        }
    }

    /// Guest config-space write: updates the local shadow then fires
    /// `CONF_WRITE` without waiting, so a config write never blocks the
    /// vCPU longer than a normal PCI config write would.
    pub fn config_write(&mut self, offset: usize, len: usize, value: u32) {
        self.config.write_config(offset, len, value);
        if let Err(e) = self.link.send(Message::ConfWrite {
            addr: offset as u32,
            val: value,
            len: len as i32,
        }) {
            error!("proxy config write failed: {}", e);
        }
    }

    fn send_conf_read(&self, offset: usize, len: usize) -> Result<u32> {
        let (waiter, notifier) = msg_socket::acquire()?;
        self.link.send(Message::ConfRead {
            addr: offset as u32,
            len: len as i32,
            waiter: notifier,
        })?;
        // A `0` here is ambiguous with a legitimate zero reply; callers
        // that care about "remote gone" must track liveness via the
        // heartbeat instead of this value alone.
        Ok(waiter.wait()? as u32)
    }

    /// BAR MMIO/PIO read at `addr` (already the full `mr.base + offset`
    /// guest address). Blocks on a wait-object.
    pub fn bar_read(&self, addr: u64, size: u32, memory: bool) -> u64 {
        match self.send_bar_read(addr, size, memory) {
            Ok(val) => val,
            Err(e) => {
                error!("proxy bar read failed: {}", e);
                u64::max_value()
            }
        }
    }

    fn send_bar_read(&self, addr: u64, size: u32, memory: bool) -> Result<u64> {
        let (waiter, notifier) = msg_socket::acquire()?;
        self.link.send(Message::BarRead { addr, size, memory, waiter: notifier })?;
        Ok(waiter.wait()?)
    }

    /// BAR MMIO/PIO write. Fire-and-forget, like `CONF_WRITE`.
    pub fn bar_write(&self, addr: u64, val: u64, size: u32, memory: bool) {
        if let Err(e) = self.link.send(Message::BarWrite { addr, val, size, memory }) {
            error!("proxy bar write failed: {}", e);
        }
    }

    /// Tears down this device's share of the link-side state. The remote
    /// process itself is not killed here; its death is observed
    /// asynchronously, and the caller is responsible for removing this
    /// device's entry from whatever proxy-list/heartbeat registry it used
    /// and for stopping the heartbeat if that was the last entry.
    pub fn shutdown(self) {
        // `mem_sync`'s Drop releases its accumulated section refs; `link`'s
        // Drop closes the socket once every Arc clone (e.g. one held by a
        // heartbeat registry) is gone.
    }
}

impl PciDevice for ProxyDevice {
    fn config_registers(&self) -> &PciConfiguration {
        &self.config
    }

    fn config_registers_mut(&mut self) -> &mut PciConfiguration {
        &mut self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{PciClassCode, PciHeaderType, PciMultimediaSubclass};
    use std::os::unix::net::UnixStream as TestStream;
    use std::thread;

    fn test_config() -> PciConfiguration {
        PciConfiguration::new(
            0x1234,
            0x5678,
            PciClassCode::Other,
            &PciMultimediaSubclass::Other,
            PciHeaderType::Device,
        )
    }

    /// Builds a `ProxyDevice` wired to an in-process fake remote thread
    /// instead of a forked process, exercising the same link/codec path
    /// the real `realize` uses without needing a live subprocess (per
    /// SPEC_FULL §8's note on proving S1/S2 against the dispatcher
    /// directly).
    fn fake_proxy_device(fake_remote: impl FnOnce(RawFd) + Send + 'static) -> ProxyDevice {
        let (host, remote) = TestStream::pair().unwrap();
        let remote_fd = remote.into_raw_fd();
        thread::spawn(move || fake_remote(remote_fd));

        let link = Arc::new(ProxyLink::new(host.into_raw_fd()));
        ProxyDevice {
            link,
            pid: 0,
            config: test_config(),
            intx_pin: PciInterruptPin::IntA,
            intx_route: IntxRoute::new(),
            intr: EventFd::new().unwrap(),
            resample: EventFd::new().unwrap(),
            mem_sync: MemorySyncListener::new(),
        }
    }

    #[test]
    fn config_write_then_read_roundtrip_s1() {
        let dev = fake_proxy_device(|fd| {
            let remote = ProxyLink::new(fd);
            let mut stored: u32 = 0;
            loop {
                match remote.recv() {
                    Ok(Message::ConfWrite { val, .. }) => stored = val,
                    Ok(Message::ConfRead { waiter, .. }) => {
                        waiter.notify(stored as u64).unwrap();
                    }
                    _ => break,
                }
            }
        });
        let mut dev = dev;
        dev.config_write(0x10, 4, 0xdead_beef);
        assert_eq!(dev.send_conf_read(0x10, 4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn bar_mmio_write_then_read_s2() {
        let dev = fake_proxy_device(|fd| {
            let remote = ProxyLink::new(fd);
            let mut stored: u64 = 0;
            loop {
                match remote.recv() {
                    Ok(Message::BarWrite { val, .. }) => stored = val,
                    Ok(Message::BarRead { waiter, .. }) => {
                        waiter.notify(stored).unwrap();
                    }
                    _ => break,
                }
            }
        });
        dev.bar_write(0x1000, 0x4142, 2, true);
        assert_eq!(dev.bar_read(0x1000, 2, true), 0x4142);
    }

    #[test]
    fn gate_drop_yields_zero_on_close_s5() {
        let dev = fake_proxy_device(|fd| {
            let remote = ProxyLink::new(fd);
            // The fake remote simulates the creation gate: it receives the
            // CONF_READ and drops the waiter fd without notifying, then
            // closes the link, as a pre-SET_IRQFD authority-error drop
            // would.
            if let Ok(Message::ConfRead { waiter, .. }) = remote.recv() {
                drop(waiter);
            }
            remote.finalize();
        });
        assert_eq!(dev.send_conf_read(0x10, 4).unwrap(), 0);
    }
}
