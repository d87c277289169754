// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The on-wire frame: a fixed-size header (`cmd`, `bytestream`, `size`, the
//! `data1` union, `num_fds`) optionally followed by a variable-length
//! `data2` byte stream, with fds riding out-of-band as `SCM_RIGHTS`.
//!
//! In memory the frame is never exposed as that C-shaped struct: callers see
//! [`Message`], a tagged sum of per-command payloads (per the redesign note
//! to replace the union with a real enum). `encode`/`decode` are the only
//! places that know the wire layout.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::wait::Notifier;

// Header layout. The fds-placeholder and data2-ptr-placeholder fields exist
// only to keep the header the same size as the struct this protocol was
// distilled from; a receiver never reads them back, so they are left zeroed
// rather than modeled as real fields.
const CMD_OFFSET: usize = 0;
const BYTESTREAM_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;
const DATA1_OFFSET: usize = 16;
// The original union's largest member is `sync_sysmem_msg_t`: three
// `REMOTE_MAX_FDS`-length (8) arrays of u64 (`gpas`, `sizes`, `offsets`),
// i.e. 192 bytes — wider than the 64-byte pad a paraphrase of the wire
// diagram might suggest, so this follows the real struct layout.
const DATA1_LEN: usize = 192;
const FDS_PLACEHOLDER_OFFSET: usize = DATA1_OFFSET + DATA1_LEN;
const FDS_PLACEHOLDER_LEN: usize = 32;
const NUM_FDS_OFFSET: usize = FDS_PLACEHOLDER_OFFSET + FDS_PLACEHOLDER_LEN;
const DATA2_PTR_OFFSET: usize = NUM_FDS_OFFSET + 4;
pub const HEADER_LEN: usize = DATA2_PTR_OFFSET + 8;

pub const MAX_FDS: usize = 8;

/// Stable wire ordinals; `decode` rejects anything outside this set rather
/// than panicking.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Init = 0,
    ConfRead = 1,
    ConfWrite = 2,
    SyncSysmem = 3,
    BarWrite = 4,
    BarRead = 5,
    SetIrqfd = 6,
    DevOpts = 7,
    DriveOpts = 8,
    DeviceAdd = 9,
    DeviceDel = 10,
    DriveAdd = 11,
    DriveDel = 12,
    ProxyPing = 13,
    BlockResize = 14,
}

impl Command {
    fn from_u32(v: u32) -> Result<Command> {
        use Command::*;
        Ok(match v {
            0 => Init,
            1 => ConfRead,
            2 => ConfWrite,
            3 => SyncSysmem,
            4 => BarWrite,
            5 => BarRead,
            6 => SetIrqfd,
            7 => DevOpts,
            8 => DriveOpts,
            9 => DeviceAdd,
            10 => DeviceDel,
            11 => DriveAdd,
            12 => DriveDel,
            13 => ProxyPing,
            14 => BlockResize,
            other => return Err(Error::UnknownCommand(other)),
        })
    }
}

/// One coalesced memory region section as it travels in a `SYNC_SYSMEM`
/// message (the fd itself rides in the message's out-of-band fd list, one
/// per region, in the same order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRegion {
    pub gpa: u64,
    pub size: u64,
    pub offset: u64,
}

/// The tagged sum of every message this protocol carries. Fds embedded here
/// are always owned: on decode they are freshly received, on encode they are
/// moved out to the wire and must not be touched again by the caller.
///
/// Every field that carries a wait-object's write-end is a [`Notifier`], not
/// a raw fd: `send` takes `Message` by value and drops it once `sendmsg` has
/// handed the kernel its own dup, which closes the sender's copy per §3's
/// "the sender closes its own copies of fds only after the send completes"
/// invariant. Decoding wraps the freshly received fd the same way, since the
/// receiver owns it outright.
#[derive(Debug)]
pub enum Message {
    Init,
    ConfRead { addr: u32, len: i32, waiter: Notifier },
    ConfWrite { addr: u32, val: u32, len: i32 },
    SyncSysmem { regions: Vec<SyncRegion>, fds: Vec<RawFd> },
    BarWrite { addr: u64, val: u64, size: u32, memory: bool },
    BarRead { addr: u64, size: u32, memory: bool, waiter: Notifier },
    SetIrqfd { intx: i32, intr: RawFd, resample: RawFd },
    DevOpts { json: Vec<u8> },
    DriveOpts { json: Vec<u8> },
    DeviceAdd { json: Vec<u8>, waiter: Notifier },
    DeviceDel { json: Vec<u8>, waiter: Notifier },
    DriveAdd { json: Vec<u8>, waiter: Notifier },
    DriveDel { json: Vec<u8>, waiter: Notifier },
    /// `waiter` is `None` for every link after the first reply lands in one
    /// heartbeat broadcast: one live reply proves the host's event loop is
    /// still running, so the rest go out fire-and-forget.
    ProxyPing { waiter: Option<Notifier> },
    BlockResize { json: Vec<u8>, waiter: Notifier },
}

impl Message {
    fn command(&self) -> Command {
        match self {
            Message::Init => Command::Init,
            Message::ConfRead { .. } => Command::ConfRead,
            Message::ConfWrite { .. } => Command::ConfWrite,
            Message::SyncSysmem { .. } => Command::SyncSysmem,
            Message::BarWrite { .. } => Command::BarWrite,
            Message::BarRead { .. } => Command::BarRead,
            Message::SetIrqfd { .. } => Command::SetIrqfd,
            Message::DevOpts { .. } => Command::DevOpts,
            Message::DriveOpts { .. } => Command::DriveOpts,
            Message::DeviceAdd { .. } => Command::DeviceAdd,
            Message::DeviceDel { .. } => Command::DeviceDel,
            Message::DriveAdd { .. } => Command::DriveAdd,
            Message::DriveDel { .. } => Command::DriveDel,
            Message::ProxyPing { .. } => Command::ProxyPing,
            Message::BlockResize { .. } => Command::BlockResize,
        }
    }
}

/// `conf_data{addr:u32, val:u32, l:i32}`, the byte-stream payload shared by
/// `CONF_READ`/`CONF_WRITE`.
fn pack_conf_data(addr: u32, val: u32, len: i32) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    NativeEndian::write_u32(&mut buf[0..4], addr);
    NativeEndian::write_u32(&mut buf[4..8], val);
    NativeEndian::write_i32(&mut buf[8..12], len);
    buf
}

fn unpack_conf_data(buf: &[u8]) -> Result<(u32, u32, i32)> {
    if buf.len() < 12 {
        return Err(Error::ShortTransfer { expected: 12, got: buf.len() });
    }
    Ok((
        NativeEndian::read_u32(&buf[0..4]),
        NativeEndian::read_u32(&buf[4..8]),
        NativeEndian::read_i32(&buf[8..12]),
    ))
}

struct EncodedFrame {
    header: [u8; HEADER_LEN],
    fds: Vec<RawFd>,
    data2: Option<Vec<u8>>,
}

fn encode(msg: &Message) -> EncodedFrame {
    let mut header = [0u8; HEADER_LEN];
    NativeEndian::write_u32(&mut header[CMD_OFFSET..], msg.command() as u32);

    let mut bytestream = false;
    let mut fds: Vec<RawFd> = Vec::new();
    let mut data2: Option<Vec<u8>> = None;

    match msg {
        Message::Init => {}
        Message::ConfRead { addr, len, waiter } => {
            bytestream = true;
            data2 = Some(pack_conf_data(*addr, 0, *len));
            fds.push(waiter.as_raw_fd());
        }
        Message::ConfWrite { addr, val, len } => {
            bytestream = true;
            data2 = Some(pack_conf_data(*addr, *val, *len));
        }
        Message::SyncSysmem { regions, fds: region_fds } => {
            for (i, r) in regions.iter().enumerate().take(8) {
                NativeEndian::write_u64(&mut header[DATA1_OFFSET + i * 8..], r.gpa);
                NativeEndian::write_u64(&mut header[DATA1_OFFSET + 64 + i * 8..], r.size);
                NativeEndian::write_u64(&mut header[DATA1_OFFSET + 128 + i * 8..], r.offset);
            }
            fds.extend(region_fds.iter());
        }
        Message::BarWrite { addr, val, size, memory } => {
            NativeEndian::write_u64(&mut header[DATA1_OFFSET..], *addr);
            NativeEndian::write_u64(&mut header[DATA1_OFFSET + 8..], *val);
            NativeEndian::write_u32(&mut header[DATA1_OFFSET + 16..], *size);
            header[DATA1_OFFSET + 20] = *memory as u8;
        }
        Message::BarRead { addr, size, memory, waiter } => {
            NativeEndian::write_u64(&mut header[DATA1_OFFSET..], *addr);
            NativeEndian::write_u32(&mut header[DATA1_OFFSET + 16..], *size);
            header[DATA1_OFFSET + 20] = *memory as u8;
            fds.push(waiter.as_raw_fd());
        }
        Message::SetIrqfd { intx, intr, resample } => {
            NativeEndian::write_i32(&mut header[DATA1_OFFSET..], *intx);
            fds.push(*intr);
            fds.push(*resample);
        }
        Message::DevOpts { json } | Message::DriveOpts { json } => {
            bytestream = true;
            data2 = Some(json.clone());
        }
        Message::DeviceAdd { json, waiter }
        | Message::DeviceDel { json, waiter }
        | Message::DriveAdd { json, waiter }
        | Message::DriveDel { json, waiter }
        | Message::BlockResize { json, waiter } => {
            bytestream = true;
            data2 = Some(json.clone());
            fds.push(waiter.as_raw_fd());
        }
        Message::ProxyPing { waiter } => {
            if let Some(w) = waiter {
                fds.push(w.as_raw_fd());
            }
        }
    }

    let size = if bytestream {
        data2.as_ref().map_or(0, |d| d.len())
    } else {
        DATA1_LEN
    };
    header[BYTESTREAM_OFFSET] = bytestream as u8;
    NativeEndian::write_u64(&mut header[SIZE_OFFSET..], size as u64);
    NativeEndian::write_u32(&mut header[NUM_FDS_OFFSET..], fds.len() as u32);

    EncodedFrame { header, fds, data2 }
}

/// Sends `msg` as two `sendmsg`s at most (header+fds, then the optional
/// `data2` payload). Takes `msg` by value and drops it once both sendmsgs
/// have completed (success or failure): `sendmsg` only dups any wait-object
/// fds the message carries to the receiver, so the sender's own copies
/// (held by the `Notifier`s embedded in `msg`) must be closed here rather
/// than left open for the caller to leak — otherwise a remote that drops
/// its dup without writing can never make the sender observe EOF on
/// `Waiter::wait`.
pub fn send(socket: RawFd, msg: Message) -> Result<()> {
    let frame = encode(&msg);
    if frame.fds.len() > MAX_FDS {
        return Err(Error::TooManyFds(frame.fds.len()));
    }
    let n = sys_util::send_with_fds(socket, &frame.header, &frame.fds)?;
    if n != HEADER_LEN {
        return Err(Error::ShortTransfer { expected: HEADER_LEN, got: n });
    }
    if let Some(data2) = frame.data2 {
        let n = sys_util::send_with_fds(socket, &data2, &[])?;
        if n != data2.len() {
            return Err(Error::ShortTransfer { expected: data2.len(), got: n });
        }
    }
    drop(msg);
    Ok(())
}

/// Receives one message. Returns `Error::ShortTransfer { got: 0, .. }` on a
/// clean EOF so callers can distinguish "peer hung up" from a malformed
/// frame while still treating both as link-fatal.
pub fn recv(socket: RawFd) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    let (n, fds) = sys_util::recv_with_fds(socket, &mut header)?;
    if n == 0 {
        return Err(Error::ShortTransfer { expected: HEADER_LEN, got: 0 });
    }
    if n != HEADER_LEN {
        return Err(Error::ShortTransfer { expected: HEADER_LEN, got: n });
    }

    let cmd = Command::from_u32(NativeEndian::read_u32(&header[CMD_OFFSET..]))?;
    let bytestream = header[BYTESTREAM_OFFSET] != 0;
    let size = NativeEndian::read_u64(&header[SIZE_OFFSET..]) as usize;
    let num_fds = NativeEndian::read_u32(&header[NUM_FDS_OFFSET..]) as usize;

    if num_fds > MAX_FDS {
        return Err(Error::TooManyFds(num_fds));
    }
    if fds.len() != num_fds {
        return Err(Error::RightsTruncated { expected: num_fds, got: fds.len() });
    }

    let data2 = if bytestream {
        let mut buf = vec![0u8; size];
        let (n, extra_fds) = sys_util::recv_with_fds(socket, &mut buf)?;
        if n != size {
            return Err(Error::ShortTransfer { expected: size, got: n });
        }
        if !extra_fds.is_empty() {
            return Err(Error::RightsTruncated { expected: 0, got: extra_fds.len() });
        }
        Some(buf)
    } else {
        None
    };

    decode(cmd, &header, fds, data2)
}

fn expect_fds(cmd: &'static str, fds: &[RawFd], expected: usize) -> Result<()> {
    if fds.len() != expected {
        return Err(Error::WrongFdCount { cmd, expected, got: fds.len() });
    }
    Ok(())
}

/// Wraps a freshly decoded wait-object fd as the owned `Notifier` the
/// receiver is entitled to.
fn owned_waiter(fd: RawFd) -> Notifier {
    // SAFETY: `fd` was just received via SCM_RIGHTS and belongs to no other
    // owner yet.
    unsafe { Notifier::from_raw_fd(fd) }
}

fn decode(
    cmd: Command,
    header: &[u8; HEADER_LEN],
    fds: Vec<RawFd>,
    data2: Option<Vec<u8>>,
) -> Result<Message> {
    Ok(match cmd {
        Command::Init => Message::Init,
        Command::ConfRead => {
            expect_fds("CONF_READ", &fds, 1)?;
            let (addr, _val, len) = unpack_conf_data(&data2.unwrap_or_default())?;
            Message::ConfRead { addr, len, waiter: owned_waiter(fds[0]) }
        }
        Command::ConfWrite => {
            expect_fds("CONF_WRITE", &fds, 0)?;
            let (addr, val, len) = unpack_conf_data(&data2.unwrap_or_default())?;
            Message::ConfWrite { addr, val, len }
        }
        Command::SyncSysmem => {
            let mut regions = Vec::with_capacity(fds.len());
            for i in 0..fds.len().min(8) {
                let gpa = NativeEndian::read_u64(&header[DATA1_OFFSET + i * 8..]);
                let size = NativeEndian::read_u64(&header[DATA1_OFFSET + 64 + i * 8..]);
                let offset = NativeEndian::read_u64(&header[DATA1_OFFSET + 128 + i * 8..]);
                regions.push(SyncRegion { gpa, size, offset });
            }
            Message::SyncSysmem { regions, fds }
        }
        Command::BarWrite => {
            expect_fds("BAR_WRITE", &fds, 0)?;
            let addr = NativeEndian::read_u64(&header[DATA1_OFFSET..]);
            let val = NativeEndian::read_u64(&header[DATA1_OFFSET + 8..]);
            let size = NativeEndian::read_u32(&header[DATA1_OFFSET + 16..]);
            let memory = header[DATA1_OFFSET + 20] != 0;
            Message::BarWrite { addr, val, size, memory }
        }
        Command::BarRead => {
            expect_fds("BAR_READ", &fds, 1)?;
            let addr = NativeEndian::read_u64(&header[DATA1_OFFSET..]);
            let size = NativeEndian::read_u32(&header[DATA1_OFFSET + 16..]);
            let memory = header[DATA1_OFFSET + 20] != 0;
            Message::BarRead { addr, size, memory, waiter: owned_waiter(fds[0]) }
        }
        Command::SetIrqfd => {
            expect_fds("SET_IRQFD", &fds, 2)?;
            let intx = NativeEndian::read_i32(&header[DATA1_OFFSET..]);
            Message::SetIrqfd { intx, intr: fds[0], resample: fds[1] }
        }
        Command::DevOpts => {
            expect_fds("DEV_OPTS", &fds, 0)?;
            Message::DevOpts { json: data2.unwrap_or_default() }
        }
        Command::DriveOpts => {
            expect_fds("DRIVE_OPTS", &fds, 0)?;
            Message::DriveOpts { json: data2.unwrap_or_default() }
        }
        Command::DeviceAdd => {
            expect_fds("DEVICE_ADD", &fds, 1)?;
            Message::DeviceAdd { json: data2.unwrap_or_default(), waiter: owned_waiter(fds[0]) }
        }
        Command::DeviceDel => {
            expect_fds("DEVICE_DEL", &fds, 1)?;
            Message::DeviceDel { json: data2.unwrap_or_default(), waiter: owned_waiter(fds[0]) }
        }
        Command::DriveAdd => {
            expect_fds("DRIVE_ADD", &fds, 1)?;
            Message::DriveAdd { json: data2.unwrap_or_default(), waiter: owned_waiter(fds[0]) }
        }
        Command::DriveDel => {
            expect_fds("DRIVE_DEL", &fds, 1)?;
            Message::DriveDel { json: data2.unwrap_or_default(), waiter: owned_waiter(fds[0]) }
        }
        Command::ProxyPing => {
            if fds.len() > 1 {
                return Err(Error::WrongFdCount { cmd: "PROXY_PING", expected: 1, got: fds.len() });
            }
            Message::ProxyPing { waiter: fds.into_iter().next().map(owned_waiter) }
        }
        Command::BlockResize => {
            expect_fds("BLOCK_RESIZE", &fds, 1)?;
            Message::BlockResize { json: data2.unwrap_or_default(), waiter: owned_waiter(fds[0]) }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn conf_write_then_read_roundtrip() {
        let (a, b) = pair();
        send(a.as_raw_fd(), Message::ConfWrite { addr: 0x10, val: 0xdeadbeef, len: 4 }).unwrap();
        match recv(b.as_raw_fd()).unwrap() {
            Message::ConfWrite { addr, val, len } => {
                assert_eq!(addr, 0x10);
                assert_eq!(val, 0xdeadbeef);
                assert_eq!(len, 4);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn bar_write_roundtrip() {
        let (a, b) = pair();
        send(
            a.as_raw_fd(),
            Message::BarWrite { addr: 0x1000, val: 0x4142, size: 2, memory: true },
        )
        .unwrap();
        match recv(b.as_raw_fd()).unwrap() {
            Message::BarWrite { addr, val, size, memory } => {
                assert_eq!(addr, 0x1000);
                assert_eq!(val, 0x4142);
                assert_eq!(size, 2);
                assert!(memory);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn bar_read_carries_waiter_fd() {
        let (a, b) = pair();
        let (waiter, notifier) = crate::wait::acquire().unwrap();
        send(a.as_raw_fd(), Message::BarRead { addr: 4, size: 4, memory: false, waiter: notifier })
            .unwrap();
        match recv(b.as_raw_fd()).unwrap() {
            Message::BarRead { waiter, .. } => {
                waiter.notify(0x4142).unwrap();
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(waiter.wait().unwrap(), 0x4142);
    }

    #[test]
    fn send_closes_its_own_copy_of_the_waiter_fd() {
        // §3's "sender closes its own copies of fds only after the send
        // completes" invariant: once `send` returns, the sender must hold
        // no surviving reference to the waiter fd, so a remote that drops
        // its dup without notifying is the *only* open write-end left, and
        // the host's `wait()` observes EOF immediately.
        let (a, b) = pair();
        let (waiter, notifier) = crate::wait::acquire().unwrap();
        send(a.as_raw_fd(), Message::BarRead { addr: 0, size: 4, memory: false, waiter: notifier })
            .unwrap();
        match recv(b.as_raw_fd()).unwrap() {
            Message::BarRead { waiter: remote_notifier, .. } => drop(remote_notifier),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(waiter.wait().unwrap(), 0);
    }

    #[test]
    fn sync_sysmem_roundtrip_preserves_all_three_arrays() {
        let (a, b) = pair();
        let tmp = tempfile::tempfile().unwrap();
        let regions = vec![
            SyncRegion { gpa: 0x1000, size: 0x2000, offset: 0 },
            SyncRegion { gpa: 0x4000, size: 0x1000, offset: 0x2000 },
        ];
        send(
            a.as_raw_fd(),
            Message::SyncSysmem { regions, fds: vec![tmp.as_raw_fd(), tmp.as_raw_fd()] },
        )
        .unwrap();
        match recv(b.as_raw_fd()).unwrap() {
            Message::SyncSysmem { regions, fds } => {
                assert_eq!(regions.len(), 2);
                assert_eq!(regions[0], SyncRegion { gpa: 0x1000, size: 0x2000, offset: 0 });
                assert_eq!(regions[1], SyncRegion { gpa: 0x4000, size: 0x1000, offset: 0x2000 });
                assert_eq!(fds.len(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_a_decode_error() {
        let (a, b) = pair();
        let mut header = [0u8; HEADER_LEN];
        NativeEndian::write_u32(&mut header[CMD_OFFSET..], 999);
        NativeEndian::write_u64(&mut header[SIZE_OFFSET..], DATA1_LEN as u64);
        sys_util::send_with_fds(a.as_raw_fd(), &header, &[]).unwrap();
        match recv(b.as_raw_fd()) {
            Err(Error::UnknownCommand(999)) => {}
            other => panic!("expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn eof_is_a_short_transfer_error() {
        let (a, b) = pair();
        drop(a);
        match recv(b.as_raw_fd()) {
            Err(Error::ShortTransfer { got: 0, .. }) => {}
            other => panic!("expected EOF ShortTransfer, got {:?}", other),
        }
    }
}
