// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `sendmsg`/`recvmsg` helpers for passing file descriptors as `SCM_RIGHTS`
//! ancillary data alongside a byte payload. This is the one piece of
//! unsafe-but-contained plumbing the frame codec (`msg_socket::wire`) is
//! built on.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Upper bound on fds passed in one message; matches `REMOTE_MAX_FDS`.
pub const SCM_MAX_FD: usize = 8;

// Large enough for `CMSG_SPACE(SCM_MAX_FD * size_of::<RawFd>())` on every
// platform this crate targets; sized generously rather than computed so the
// buffer can live on the stack.
const CMSG_BUF_LEN: usize = 256;

/// Sends `bytes` together with `fds` (as `SCM_RIGHTS`) in a single
/// `sendmsg(2)` call. `fds.len()` must not exceed `SCM_MAX_FD`.
pub fn send_with_fds(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    assert!(fds.len() <= SCM_MAX_FD);

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let fd_bytes_len = fds.len() * mem::size_of::<RawFd>();
    // SAFETY: CMSG_SPACE/CMSG_LEN are pure computations on plain integers.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes_len as u32) as usize };

    let mut msg = libc::msghdr {
        msg_name: ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: if fds.is_empty() {
            ptr::null_mut()
        } else {
            cmsg_buf.as_mut_ptr() as *mut libc::c_void
        },
        msg_controllen: if fds.is_empty() { 0 } else { cmsg_space },
        msg_flags: 0,
    };

    if !fds.is_empty() {
        // SAFETY: `msg.msg_control` points at `cmsg_buf`, which is large
        // enough for `cmsg_space` bytes (checked by the assert above against
        // the const upper bound).
        unsafe {
            let cmsg_ptr = libc::CMSG_FIRSTHDR(&msg);
            ptr::write(
                cmsg_ptr,
                libc::cmsghdr {
                    cmsg_len: libc::CMSG_LEN(fd_bytes_len as u32) as _,
                    cmsg_level: libc::SOL_SOCKET,
                    cmsg_type: libc::SCM_RIGHTS,
                },
            );
            let data_ptr = libc::CMSG_DATA(cmsg_ptr) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data_ptr.add(i), *fd);
            }
        }
    }

    // SAFETY: `msg` is fully initialized and its buffers outlive this call.
    let ret = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Receives into `bytes` and returns any fds that arrived as `SCM_RIGHTS`
/// ancillary data, up to `SCM_MAX_FD` of them.
pub fn recv_with_fds(socket: RawFd, bytes: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_mut_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg = libc::msghdr {
        msg_name: ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: CMSG_BUF_LEN,
        msg_flags: 0,
    };

    // SAFETY: `msg` points at stack buffers sized above and outliving the call.
    let ret = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: walking the cmsg chain the kernel just filled in.
    unsafe {
        let mut cmsg_ptr = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg_ptr.is_null() {
            let cmsg = &*cmsg_ptr;
            if cmsg.cmsg_level == libc::SOL_SOCKET && cmsg.cmsg_type == libc::SCM_RIGHTS {
                let data_ptr = libc::CMSG_DATA(cmsg_ptr) as *const RawFd;
                let header_len = (data_ptr as usize) - (cmsg_ptr as usize);
                let n_fds = (cmsg.cmsg_len - header_len) / mem::size_of::<RawFd>();
                for i in 0..n_fds.min(SCM_MAX_FD) {
                    fds.push(ptr::read_unaligned(data_ptr.add(i)));
                }
            }
            cmsg_ptr = libc::CMSG_NXTHDR(&msg, cmsg_ptr);
        }
    }

    Ok((ret as usize, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn roundtrip_bytes_and_fds() {
        let (a, b) = UnixStream::pair().unwrap();
        let evt = crate::EventFd::new().unwrap();
        evt.write(7).unwrap();

        let payload = b"hello";
        let sent = send_with_fds(a.as_raw_fd(), payload, &[evt.as_raw_fd()]).unwrap();
        assert_eq!(sent, payload.len());

        let mut buf = [0u8; 16];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf[..n], payload);
        assert_eq!(fds.len(), 1);

        // SAFETY: `fds[0]` is a just-received, owned duplicate of `evt`'s fd.
        let received = unsafe { crate::EventFd::from_raw_fd(fds[0]) };
        assert_eq!(received.read().unwrap(), 7);
    }

    #[test]
    fn no_fds_is_fine() {
        let (a, b) = UnixStream::pair().unwrap();
        send_with_fds(a.as_raw_fd(), b"abc", &[]).unwrap();
        let mut buf = [0u8; 8];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 3);
        assert!(fds.is_empty());
    }
}
