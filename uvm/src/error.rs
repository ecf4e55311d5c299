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

use thiserror::Error;

/// Recoverable errors of the frame allocator and the object layer.
///
/// Invariant violations (double free, reference count underflow, ...) are
/// not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmError {
    #[error("out of physical frames (requested a run of {requested})")]
    OutOfFrames { requested: usize },

    #[error("run length {requested} is not supported (max {max})")]
    InvalidRunLength { requested: usize, max: usize },

    #[error("segment at {base:#x} with length {length:#x} holds no whole page")]
    InvalidSegment { base: usize, length: usize },

    #[error("segment at {base:#x} with length {length:#x} overlaps a registered segment")]
    SegmentOverlap { base: usize, length: usize },

    #[error("no more than {max} segments can be registered")]
    TooManySegments { max: usize },

    #[error("segments cannot be registered after the frame table was built")]
    AllocatorSealed,

    #[error("offset {offset:#x} is already occupied")]
    OffsetOccupied { offset: u64 },

    #[error("region at {start:#x} overlaps an existing mapping")]
    RegionOverlap { start: usize },

    #[error("unknown pager type {0}")]
    UnknownPager(u8),
}

/// Errors reported by the architecture page-table layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    #[error("address space does not exist")]
    NoAddressSpace,

    #[error("page table memory exhausted")]
    ResourceShortage,
}

/// Reasons why a page fault could not be resolved.
///
/// All of these terminate (or signal) the faulting thread; none of them is
/// a kernel panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("pager cannot produce a page for offset {offset:#x}")]
    Unresolvable { offset: u64 },

    #[error("no mapping covers address {vaddr:#x}")]
    NotMapped { vaddr: usize },

    #[error("access to {vaddr:#x} is not permitted by its mapping")]
    ProtectionViolation { vaddr: usize },

    #[error("out of memory while resolving fault")]
    OutOfMemory,

    #[error("installing translation failed: {0}")]
    Pmap(#[from] PmapError),
}
