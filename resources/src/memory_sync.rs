// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Observes the host's guest-RAM topology and batches it into `SYNC_SYSMEM`
//! messages for a remote. Built over `sys_util::MemoryRegion`, a stand-in
//! for whatever address-space type a real embedding has; this listener only
//! ever looks at the `(kind, region_id, gpa, size, host_addr, host_offset,
//! fd, page_size)` view it exposes, so unlike the original's
//! `proxy_ml_commit` there is no separate host-address lookup at commit
//! time — each `MemoryRegion` already carries its own fd and offset.

use std::os::unix::io::RawFd;

use msg_socket::{Message, SyncRegion};
use sys_util::{MemoryRegion, RegionKind};

fn align_down(x: u64, page: u64) -> u64 {
    x - (x % page)
}

fn align_up(x: u64, page: u64) -> u64 {
    let rem = x % page;
    if rem == 0 {
        x
    } else {
        x + (page - rem)
    }
}

/// One pending, page-aligned section of the sweep currently being built.
#[derive(Debug)]
struct Section {
    region_id: u64,
    gpa: u64,
    host: u64,
    size: u64,
    offset: u64,
    /// The backing fd as the caller's `MemoryRegion` identifies it, used
    /// only to test whether the next section shares it.
    source_fd: RawFd,
    /// An owned `dup(2)` of `source_fd`, independent of however long the
    /// originating `MemoryRegion` itself lives; this is what gets sent.
    owned_fd: RawFd,
}

/// Accumulates one topology sweep (`begin` .. `region_add` * N .. `commit`)
/// and turns it into `SYNC_SYSMEM` messages with adjacent same-fd sections
/// coalesced.
#[derive(Default)]
pub struct MemorySyncListener {
    sections: Vec<Section>,
}

impl MemorySyncListener {
    pub fn new() -> MemorySyncListener {
        MemorySyncListener { sections: Vec::new() }
    }

    /// A new topology sweep is starting: release every accumulated section
    /// (closing its dup'd fd) and reset.
    pub fn begin(&mut self) {
        for section in self.sections.drain(..) {
            // SAFETY: `owned_fd` is a dup this listener alone owns.
            unsafe {
                libc::close(section.owned_fd);
            }
        }
    }

    /// Reports one section of the current topology. Non-RAM sections (ROM,
    /// MMIO) are dropped; eligible sections are page-aligned and merged into
    /// the previous section when region identity, fd, and host contiguity
    /// all match, otherwise appended as a new section.
    ///
    /// # Panics
    /// Panics if `region.gpa` starts before the last accumulated section's
    /// start: sections must be reported in non-decreasing guest-address
    /// order.
    pub fn region_add(&mut self, region: &MemoryRegion) {
        if region.kind != RegionKind::Ram {
            return;
        }

        let page = region.page_size;
        let gpa_aligned = align_down(region.gpa.raw_value(), page);
        let host_aligned = align_down(region.host_addr, page);
        let shift = region.gpa.raw_value() - gpa_aligned;
        let size_aligned = align_up(region.size + shift, page);
        let offset_aligned = region.host_offset.saturating_sub(shift);

        if let Some(prev) = self.sections.last() {
            assert!(
                gpa_aligned >= prev.gpa,
                "memory-sync sections must arrive in non-decreasing gpa order: \
                 new gpa {:#x} precedes previous section start {:#x}",
                gpa_aligned,
                prev.gpa
            );
        }

        if let Some(prev) = self.sections.last_mut() {
            if prev.region_id == region.region_id
                && prev.source_fd == region.fd
                && prev.host + prev.size == host_aligned
            {
                prev.size += size_aligned;
                return;
            }
        }

        // SAFETY: `region.fd` is a valid fd owned by the memory subsystem
        // for at least the duration of this call; dup gives this listener
        // its own independent lifetime over the same file.
        let owned_fd = unsafe { libc::dup(region.fd) };
        self.sections.push(Section {
            region_id: region.region_id,
            gpa: gpa_aligned,
            host: host_aligned,
            size: size_aligned,
            offset: offset_aligned,
            source_fd: region.fd,
            owned_fd,
        });
    }

    /// The sweep is complete: builds one `SYNC_SYSMEM` message carrying up
    /// to 8 regions. More than 8 accumulated sections is a sign the sweep
    /// input didn't coalesce as the 8-fd transmission limit assumes; the
    /// overflow is logged and dropped rather than silently truncated.
    pub fn commit(&self) -> Message {
        if self.sections.len() > 8 {
            sys_util::warn!(
                "memory-sync sweep produced {} sections, dropping {} beyond the 8-fd limit",
                self.sections.len(),
                self.sections.len() - 8
            );
        }
        let regions = self
            .sections
            .iter()
            .take(8)
            .map(|s| SyncRegion { gpa: s.gpa, size: s.size, offset: s.offset })
            .collect();
        let fds = self.sections.iter().take(8).map(|s| s.owned_fd).collect();
        Message::SyncSysmem { regions, fds }
    }
}

impl Drop for MemorySyncListener {
    fn drop(&mut self) {
        self.begin();
    }
}
