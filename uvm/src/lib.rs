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

//! Memory-management core of a Unix-like kernel: physical frames, anonymous
//! memory cells, backing-store objects and the page fault path.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod anon;
mod error;
mod fault;
mod frame_allocator;
mod page;
mod util;
mod uvm_config;
mod vm_object;

#[cfg(test)]
mod test;

pub use crate::anon::{AnonGuard, AnonRef};
pub use crate::error::{FaultError, MmError, PmapError};
pub use crate::fault::{
    AccessKind, AccessRights, FaultHandler, FaultOutcome, FaultSource, FaultStats,
};
pub use crate::frame_allocator::{AllocOptions, FrameAllocator, FrameStats};
pub use crate::page::{FrameNumber, Page, PageFlags, PhysAddr, PAGE_SHIFT, PAGE_SIZE};
pub use crate::vm_object::{ObjectId, ObjectPage, VmObject};
pub use uvm_config::{UvmConfig, POISON_BYTE};
pub mod modules;
