// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The remote side of a proxied device: a single-threaded command
//! dispatcher that serves `CONF_*`/`BAR_*`/`SYNC_SYSMEM`/`SET_IRQFD` and the
//! device/drive hotplug commands against a local device model. Mirrors
//! `remote/remote-main.c`'s `process_msg` switch, generalized from a global
//! `create_done`/`remote_pci_dev` pair of statics to fields on a value.

use std::fmt::{self, Display};
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::ptr;

use msg_socket::{LinkEvent, Message, Notifier, ProxyLink, SyncRegion};
use sys_util::EventFd;

use crate::bus::Bus;
use crate::pci::PciConfiguration;

#[derive(Debug)]
pub enum Error {
    /// A send/recv on the link failed.
    Link(msg_socket::Error),
    /// Delivering a reply through a wait-object failed at the OS level.
    Wait(sys_util::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Link(e) => write!(f, "remote dispatcher link error: {}", e),
            Error::Wait(e) => write!(f, "remote dispatcher wait-object error: {}", e),
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

/// The local device/drive model `DEV_OPTS`/`DRIVE_OPTS`/`DEVICE_ADD`/
/// `DEVICE_DEL`/`DRIVE_ADD`/`DRIVE_DEL`/`BLOCK_RESIZE` operate against.
/// Kept as a trait so the dispatcher's command handling is testable without
/// a real block/SCSI stack (explicitly out of scope for this core).
///
/// Every method takes the command's JSON option dictionary already parsed.
/// A `Err` here is logged, never surfaced on the wire: the protocol replies
/// `1` regardless of success (see DESIGN.md's record of this decision).
pub trait DeviceModel: Send {
    fn add_device(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String>;
    fn del_device(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String>;
    fn add_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String>;
    fn del_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String>;
    fn resize_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String>;
}

/// Tracks the guest-RAM mappings most recently installed by `SYNC_SYSMEM`,
/// replacing the whole set on every reconfigure: a sweep arrives as one
/// full topology snapshot, never a diff.
struct RemoteMemory {
    mappings: Vec<(*mut libc::c_void, usize)>,
}

impl RemoteMemory {
    fn new() -> RemoteMemory {
        RemoteMemory { mappings: Vec::new() }
    }

    /// Unmaps the previous sweep, then maps each `(region, fd)` pair in
    /// order and takes ownership of every fd (closing it once mmap has its
    /// own reference, per `close(2)`'s "mapping survives fd close" rule).
    fn reconfigure(&mut self, regions: &[SyncRegion], fds: Vec<RawFd>) {
        self.unmap_all();
        for (region, fd) in regions.iter().zip(fds.iter()) {
            let len = region.size as usize;
            if len == 0 {
                continue;
            }
            // SAFETY: `fd` is open for the duration of this call; the
            // mapping keeps the file alive independent of the fd itself.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    *fd,
                    region.offset as libc::off_t,
                )
            };
            if addr == libc::MAP_FAILED {
                warn!(
                    "failed to map guest-RAM section at gpa {:#x}: {}",
                    region.gpa,
                    io::Error::last_os_error()
                );
                continue;
            }
            self.mappings.push((addr, len));
        }
        for fd in fds {
            // SAFETY: only the mapping (if any) still needs this fd now.
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn unmap_all(&mut self) {
        for (addr, len) in self.mappings.drain(..) {
            // SAFETY: `addr`/`len` came from a successful mmap this struct
            // alone owns.
            unsafe {
                libc::munmap(addr, len);
            }
        }
    }
}

impl Drop for RemoteMemory {
    fn drop(&mut self) {
        self.unmap_all();
    }
}

/// Owns the local device model a proxied device serves over the link:
/// config space, MMIO/PIO buses, the guest-RAM mappings `SYNC_SYSMEM`
/// installs, and the creation gate. One value per remote process, handled
/// single-threaded from the link's perspective.
pub struct RemoteState<D: DeviceModel> {
    model: D,
    config: PciConfiguration,
    mmio: Bus,
    pio: Bus,
    memory: RemoteMemory,
    create_done: bool,
    intx: Option<i32>,
    intr: Option<EventFd>,
    resample: Option<EventFd>,
}

impl<D: DeviceModel> RemoteState<D> {
    pub fn new(model: D, config: PciConfiguration, mmio: Bus, pio: Bus) -> RemoteState<D> {
        RemoteState {
            model,
            config,
            mmio,
            pio,
            memory: RemoteMemory::new(),
            create_done: false,
            intx: None,
            intr: None,
            resample: None,
        }
    }

    /// Whether `SET_IRQFD` has been processed yet; `CONF_*`/`BAR_*` before
    /// this point are silently discarded by the creation gate.
    pub fn create_done(&self) -> bool {
        self.create_done
    }

    /// Asserts the INTx line the host installed via `SET_IRQFD`, for the
    /// local device model to call when it wants to raise an interrupt.
    /// A no-op before `SET_IRQFD` has landed.
    pub fn signal_intx(&self) -> sys_util::Result<()> {
        match &self.intr {
            Some(intr) => intr.write(1),
            None => Ok(()),
        }
    }

    /// Runs the dispatch loop against `link` until it hangs up.
    pub fn run(&mut self, link: &ProxyLink) -> Result<()> {
        link.start_handler(|link, event| match event {
            LinkEvent::Readable => match link.recv() {
                Ok(msg) => {
                    if let Err(e) = self.dispatch(msg) {
                        error!("remote dispatch failed: {}", e);
                    }
                    true
                }
                Err(e) => {
                    error!("remote recv failed: {}", e);
                    false
                }
            },
            LinkEvent::HungUp => false,
        })?;
        Ok(())
    }

    /// Handles one inbound message, dispatching on its command ordinal.
    pub fn dispatch(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Init => Ok(()),

            Message::ConfRead { addr, len, waiter } => {
                if !self.create_done {
                    drop_waiter(waiter);
                    return Ok(());
                }
                let val = self.config.read_config(addr as usize, len as usize);
                notify(waiter, val as u64)
            }
            Message::ConfWrite { addr, val, len } => {
                if self.create_done {
                    self.config.write_config(addr as usize, len as usize, val);
                }
                Ok(())
            }

            Message::SyncSysmem { regions, fds } => {
                self.memory.reconfigure(&regions, fds);
                Ok(())
            }

            Message::BarRead { addr, size, memory, waiter } => {
                if !self.create_done {
                    drop_waiter(waiter);
                    return Ok(());
                }
                let val = self.read_bar(addr, size, memory);
                notify(waiter, val)
            }
            Message::BarWrite { addr, val, size, memory } => {
                if self.create_done {
                    self.write_bar(addr, val, size, memory);
                }
                Ok(())
            }

            Message::SetIrqfd { intx, intr, resample } => {
                self.intx = Some(intx);
                // SAFETY: `intr`/`resample` are owned fds freshly decoded
                // from this message.
                self.intr = Some(unsafe { EventFd::from_raw_fd(intr) });
                self.resample = Some(unsafe { EventFd::from_raw_fd(resample) });
                self.create_done = true;
                Ok(())
            }

            Message::DevOpts { json } => {
                self.with_opts(&json, DeviceModel::add_device);
                Ok(())
            }
            Message::DriveOpts { json } => {
                self.with_opts(&json, DeviceModel::add_drive);
                Ok(())
            }
            Message::DeviceAdd { json, waiter } => {
                self.with_opts(&json, DeviceModel::add_device);
                notify(waiter, 1)
            }
            Message::DeviceDel { json, waiter } => {
                self.with_opts(&json, DeviceModel::del_device);
                notify(waiter, 1)
            }
            Message::DriveAdd { json, waiter } => {
                self.with_opts(&json, DeviceModel::add_drive);
                notify(waiter, 1)
            }
            Message::DriveDel { json, waiter } => {
                self.with_opts(&json, DeviceModel::del_drive);
                notify(waiter, 1)
            }
            Message::BlockResize { json, waiter } => {
                self.with_opts(&json, DeviceModel::resize_drive);
                notify(waiter, 1)
            }

            Message::ProxyPing { waiter } => match waiter {
                Some(w) => notify(w, std::process::id() as u64),
                None => Ok(()),
            },
        }
    }

    /// Parses `json` as an option dictionary and runs `op` against the
    /// device model, logging either failure without surfacing it on the
    /// wire: the reply is always `1` regardless of outcome.
    fn with_opts(
        &mut self,
        json: &[u8],
        op: impl FnOnce(&mut D, &serde_json::Value) -> std::result::Result<(), String>,
    ) {
        let opts = match serde_json::from_slice::<serde_json::Value>(json) {
            Ok(v) => v,
            Err(e) => {
                error!("malformed option dictionary: {}", e);
                return;
            }
        };
        if let Err(e) = op(&mut self.model, &opts) {
            error!("device-model operation failed: {}", e);
        }
    }

    fn read_bar(&self, addr: u64, size: u32, memory: bool) -> u64 {
        let bus = if memory { &self.mmio } else { &self.pio };
        let len = (size as usize).min(8);
        let mut buf = [0u8; 8];
        bus.read(addr, &mut buf[..len]);
        let mut val = 0u64;
        for (i, b) in buf[..len].iter().enumerate() {
            val |= (*b as u64) << (8 * i);
        }
        val
    }

    fn write_bar(&self, addr: u64, val: u64, size: u32, memory: bool) {
        let bus = if memory { &self.mmio } else { &self.pio };
        let len = (size as usize).min(8);
        let mut buf = [0u8; 8];
        for i in 0..len {
            buf[i] = (val >> (8 * i)) as u8;
        }
        bus.write(addr, &buf[..len]);
    }
}

fn notify(waiter: Notifier, value: u64) -> Result<()> {
    Ok(waiter.notify(value)?)
}

/// Drops a waiter without replying: the creation gate's silent-discard
/// path. Closing immediately, rather than leaking it until this
/// process exits, is what lets the host's blocked `wait()` observe `0` as
/// soon as the gate drops the message instead of only once the link itself
/// goes away.
fn drop_waiter(waiter: Notifier) {
    drop(waiter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{PciClassCode, PciHeaderType, PciMultimediaSubclass};
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use std::sync::{Arc, Mutex};
    use tempfile::tempfile;

    #[derive(Default)]
    struct FakeModel {
        calls: Vec<String>,
    }

    impl DeviceModel for FakeModel {
        fn add_device(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String> {
            self.calls.push(format!("add_device:{}", opts));
            Ok(())
        }
        fn del_device(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String> {
            self.calls.push(format!("del_device:{}", opts));
            Ok(())
        }
        fn add_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String> {
            self.calls.push(format!("add_drive:{}", opts));
            Ok(())
        }
        fn del_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String> {
            self.calls.push(format!("del_drive:{}", opts));
            Ok(())
        }
        fn resize_drive(&mut self, opts: &serde_json::Value) -> std::result::Result<(), String> {
            self.calls.push(format!("resize_drive:{}", opts));
            Ok(())
        }
    }

    struct RegisterFile(Vec<u8>);
    impl crate::bus::BusDevice for RegisterFile {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            let off = offset as usize;
            for (i, b) in data.iter_mut().enumerate() {
                *b = *self.0.get(off + i).unwrap_or(&0);
            }
        }
        fn write(&mut self, offset: u64, data: &[u8]) {
            let off = offset as usize;
            for (i, b) in data.iter().enumerate() {
                if let Some(slot) = self.0.get_mut(off + i) {
                    *slot = *b;
                }
            }
        }
    }

    fn test_state() -> RemoteState<FakeModel> {
        let config = PciConfiguration::new(
            0x1234,
            0x5678,
            PciClassCode::Other,
            &PciMultimediaSubclass::Other,
            PciHeaderType::Device,
        );
        let mut mmio = Bus::new();
        mmio.insert(Arc::new(Mutex::new(RegisterFile(vec![0u8; 0x100]))), 0x1000, 0x100)
            .unwrap();
        let pio = Bus::new();
        RemoteState::new(FakeModel::default(), config, mmio, pio)
    }

    fn set_irqfd(state: &mut RemoteState<FakeModel>) {
        let intr = EventFd::new().unwrap().into_raw_fd();
        let resample = EventFd::new().unwrap().into_raw_fd();
        state.dispatch(Message::SetIrqfd { intx: 0, intr, resample }).unwrap();
    }

    #[test]
    fn gate_drops_conf_read_and_yields_zero_before_set_irqfd() {
        let mut state = test_state();
        assert!(!state.create_done());
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state
            .dispatch(Message::ConfRead { addr: 0, len: 4, waiter: notifier })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), 0);
    }

    #[test]
    fn gate_drops_conf_write_before_set_irqfd() {
        let mut state = test_state();
        state.dispatch(Message::ConfWrite { addr: 0x10, val: 0x1111_1111, len: 4 }).unwrap();
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        set_irqfd(&mut state);
        state
            .dispatch(Message::ConfRead { addr: 0x10, len: 4, waiter: notifier })
            .unwrap();
        // The pre-gate write above must not have landed.
        assert_ne!(waiter.wait().unwrap(), 0x1111_1111);
    }

    #[test]
    fn config_write_then_read_roundtrip_s1() {
        let mut state = test_state();
        set_irqfd(&mut state);
        state.dispatch(Message::ConfWrite { addr: 0x10, val: 0xdead_beef, len: 4 }).unwrap();
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state
            .dispatch(Message::ConfRead { addr: 0x10, len: 4, waiter: notifier })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), 0xdead_beef);
    }

    #[test]
    fn bar_write_then_read_roundtrip_s2() {
        let mut state = test_state();
        set_irqfd(&mut state);
        state
            .dispatch(Message::BarWrite { addr: 0x1004, val: 0x42, size: 2, memory: true })
            .unwrap();
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state
            .dispatch(Message::BarRead {
                addr: 0x1004,
                size: 2,
                memory: true,
                waiter: notifier,
            })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), 0x42);
    }

    #[test]
    fn device_add_invokes_model_and_replies_one() {
        let mut state = test_state();
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state
            .dispatch(Message::DeviceAdd {
                json: br#"{"id":"disk0"}"#.to_vec(),
                waiter: notifier,
            })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), 1);
        assert_eq!(state.model.calls, vec!["add_device:{\"id\":\"disk0\"}"]);
    }

    #[test]
    fn block_resize_replies_one_even_when_model_errors() {
        struct FailingModel;
        impl DeviceModel for FailingModel {
            fn add_device(&mut self, _: &serde_json::Value) -> std::result::Result<(), String> {
                Ok(())
            }
            fn del_device(&mut self, _: &serde_json::Value) -> std::result::Result<(), String> {
                Ok(())
            }
            fn add_drive(&mut self, _: &serde_json::Value) -> std::result::Result<(), String> {
                Ok(())
            }
            fn del_drive(&mut self, _: &serde_json::Value) -> std::result::Result<(), String> {
                Ok(())
            }
            fn resize_drive(&mut self, _: &serde_json::Value) -> std::result::Result<(), String> {
                Err("no such drive".to_string())
            }
        }
        let config = PciConfiguration::new(
            0,
            0,
            PciClassCode::Other,
            &PciMultimediaSubclass::Other,
            PciHeaderType::Device,
        );
        let mut state = RemoteState::new(FailingModel, config, Bus::new(), Bus::new());
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state
            .dispatch(Message::BlockResize {
                json: br#"{"drive":"missing"}"#.to_vec(),
                waiter: notifier,
            })
            .unwrap();
        assert_eq!(waiter.wait().unwrap(), 1);
    }

    #[test]
    fn malformed_json_does_not_panic() {
        let mut state = test_state();
        state.dispatch(Message::DevOpts { json: b"not json".to_vec() }).unwrap();
        assert!(state.model.calls.is_empty());
    }

    #[test]
    fn proxy_ping_replies_with_pid_s6() {
        let mut state = test_state();
        let (waiter, notifier) = msg_socket::acquire().unwrap();
        state.dispatch(Message::ProxyPing { waiter: Some(notifier) }).unwrap();
        assert_eq!(waiter.wait().unwrap(), std::process::id() as u64);
    }

    #[test]
    fn proxy_ping_without_waiter_is_a_no_op() {
        let mut state = test_state();
        state.dispatch(Message::ProxyPing { waiter: None }).unwrap();
    }

    #[test]
    fn sync_sysmem_reconfigure_takes_ownership_of_fds() {
        let mut state = test_state();
        let tmp = tempfile().unwrap();
        tmp.set_len(0x1000).unwrap();
        // SAFETY: dup gives dispatch an owned fd it is entitled to consume.
        let owned = unsafe { libc::dup(tmp.as_raw_fd()) };
        let regions = vec![SyncRegion { gpa: 0x1000, size: 0x1000, offset: 0 }];
        state.dispatch(Message::SyncSysmem { regions, fds: vec![owned] }).unwrap();
        // SAFETY: probing fd validity only, no access through it.
        let flags = unsafe { libc::fcntl(owned, libc::F_GETFD) };
        assert_eq!(flags, -1, "reconfigure must close the fd once mapped");
    }
}
