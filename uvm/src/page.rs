/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::vm_object::ObjectId;

/// Size of one page frame in bytes
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Returns `None` if rounding up would overflow
    pub const fn align_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(addr) => Some(Self(addr & !(PAGE_SIZE - 1))),
            None => None,
        }
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Index of a frame descriptor inside the frame allocator's arena.
///
/// Frame numbers are dense across all registered segments, so they do not
/// correspond to `paddr >> PAGE_SHIFT` when segments are discontiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(pub(crate) usize);

impl FrameNumber {
    pub const fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// State bits of a page frame descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Frame is handed out by the frame allocator
        const ALLOCATED = 1 << 0;
        /// Mirrors the hardware referenced (accessed) bit
        const REFERENCED = 1 << 1;
        /// Mirrors the hardware modified (dirty) bit
        const MODIFIED = 1 << 2;
        /// Frame is owned by an anonymous memory cell
        const ANON = 1 << 3;
        /// Frame is part of a run but not its head
        const TAIL = 1 << 4;
    }
}

impl PageFlags {
    /// Bits that mirror hardware state and survive reallocation unless
    /// the caller asks for zero-filled frames
    pub const HW_MIRROR: PageFlags = PageFlags::REFERENCED.union(PageFlags::MODIFIED);
}

const NO_OWNER: u64 = 0;

/// Descriptor of one physical page frame.
///
/// All fields are atomics so that descriptors can be read and the access
/// bits updated without holding the frame allocator's lock. The allocation
/// state (`ALLOCATED`, `TAIL`, `run_len`) is only ever written while that
/// lock is held.
pub struct Page {
    paddr: PhysAddr,
    flags: AtomicU32,
    /// Number of frames in the run if this is the head of an allocated run
    run_len: AtomicUsize,
    /// Raw [`ObjectId`] of the owning object, `0` if not resident in one
    owner: AtomicU64,
    /// Offset inside the owning object
    offset: AtomicU64,
}

impl Page {
    pub(crate) fn new(paddr: PhysAddr) -> Self {
        Self {
            paddr,
            flags: AtomicU32::new(0),
            run_len: AtomicUsize::new(0),
            owner: AtomicU64::new(NO_OWNER),
            offset: AtomicU64::new(0),
        }
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_allocated(&self) -> bool {
        self.flags().contains(PageFlags::ALLOCATED)
    }

    /// Length of the run this frame heads, `0` for free or tail frames
    pub fn run_len(&self) -> usize {
        self.run_len.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Object and offset this page is resident at
    pub fn owner(&self) -> Option<(ObjectId, u64)> {
        let raw = self.owner.load(Ordering::Acquire);
        ObjectId::from_raw(raw).map(|id| (id, self.offset.load(Ordering::Acquire)))
    }

    pub(crate) fn set_owner(&self, id: ObjectId, offset: u64) {
        // offset first: a reader that sees the owner also sees the offset
        self.offset.store(offset, Ordering::Release);
        self.owner.store(id.as_raw(), Ordering::Release);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    pub(crate) fn replace_flags(&self, flags: PageFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn set_run_len(&self, len: usize) {
        self.run_len.store(len, Ordering::Release);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("flags", &self.flags())
            .field("run_len", &self.run_len())
            .field("owner", &self.owner())
            .finish()
    }
}
