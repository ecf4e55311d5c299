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

//! Anonymous memory cells.
//!
//! A cell is a reference counted handle to at most one page frame. Every
//! [`AnonRef`] value stands for exactly one reference: new references are
//! only created through [`AnonGuard::hold`] and given back through
//! [`AnonRef::release`]. The count and the page may only be touched while
//! the cell is locked, which the guard type enforces.
//!
//! Faults working on a cell take a short-lived [`AnonPin`]. Pins keep the
//! cell alive like any other reference but are not counted as holders, so
//! they never make a cell look shared.

use alloc::sync::Arc;
use core::fmt;

use log::{error, trace};
use spin::{Mutex, MutexGuard};

use crate::{
    frame_allocator::FrameAllocator,
    page::{FrameNumber, PageFlags},
    util::fail_on_leak,
};

struct AnonState {
    ref_cnt: usize,
    /// Part of `ref_cnt` taken by pins
    pins: usize,
    page: Option<FrameNumber>,
}

struct AnonCell {
    state: Mutex<AnonState>,
}

/// One reference to an anonymous memory cell.
///
/// Has to be given back through [`AnonRef::release`], dropping it leaks the
/// reference.
pub struct AnonRef {
    cell: Arc<AnonCell>,
    released: bool,
}

/// Reference held by a fault for the time it works on a cell
pub(crate) struct AnonPin {
    anon: AnonRef,
}

/// Exclusive access to a locked cell. Unlocks when dropped.
pub struct AnonGuard<'a> {
    state: MutexGuard<'a, AnonState>,
    cell: &'a Arc<AnonCell>,
}

impl AnonRef {
    /// Creates a new cell with a reference count of 1 and no page
    pub fn alloc() -> Self {
        Self::from_cell(Arc::new(AnonCell {
            state: Mutex::new(AnonState {
                ref_cnt: 1,
                pins: 0,
                page: None,
            }),
        }))
    }

    fn from_cell(cell: Arc<AnonCell>) -> Self {
        Self {
            cell,
            released: false,
        }
    }

    /// Locks the cell, blocking while another holder has it locked.
    ///
    /// The lock is not reentrant: locking a cell twice from the same thread
    /// deadlocks.
    pub fn lock(&self) -> AnonGuard<'_> {
        let state = self.cell.state.lock();
        if state.ref_cnt == 0 {
            error!("Locking anon cell {:p} after it was freed", Arc::as_ptr(&self.cell));
            panic!("anon cell used after its last reference was dropped");
        }

        AnonGuard {
            state,
            cell: &self.cell,
        }
    }

    /// Drops this reference.
    ///
    /// Locks the cell, decrements the reference count and unlocks it again.
    /// If this was the last reference, the cell's page is returned to
    /// `frames`. Returns `true` if the cell was freed.
    pub fn release(mut self, frames: &FrameAllocator) -> bool {
        let freed = self.lock().drop_ref(frames, false);
        self.released = true;
        freed
    }

    /// Both handles refer to the same cell
    pub fn same_cell(&self, other: &AnonRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Drop for AnonRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        error!(
            "Anon reference to {:p} dropped without release, leaking it",
            Arc::as_ptr(&self.cell)
        );
        fail_on_leak("anon reference dropped without release");
    }
}

impl AnonPin {
    pub(crate) fn lock(&self) -> AnonGuard<'_> {
        self.anon.lock()
    }

    /// The pinned cell, for comparisons with [`AnonRef::same_cell`]
    pub(crate) fn anon(&self) -> &AnonRef {
        &self.anon
    }

    /// Gives the pin back, freeing the cell if it was the last reference
    pub(crate) fn release(mut self, frames: &FrameAllocator) -> bool {
        let freed = self.anon.lock().drop_ref(frames, true);
        self.anon.released = true;
        freed
    }
}

impl fmt::Debug for AnonRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnonRef({:p})", Arc::as_ptr(&self.cell))
    }
}

impl AnonGuard<'_> {
    /// All references, pins included
    pub fn ref_count(&self) -> usize {
        self.state.ref_cnt
    }

    /// References that are not pins: the objects sharing this cell
    pub fn holder_count(&self) -> usize {
        self.state.ref_cnt - self.state.pins
    }

    pub fn page(&self) -> Option<FrameNumber> {
        self.state.page
    }

    /// Attaches the first backing page.
    ///
    /// # Panics
    ///
    /// If the cell already has a page.
    pub fn set_page(&mut self, frame: FrameNumber, frames: &FrameAllocator) {
        assert!(
            self.state.page.is_none(),
            "anon cell already owns a page"
        );

        frames.page(frame).set_flags(PageFlags::ANON);
        self.state.page = Some(frame);
    }

    /// Acquires an additional reference
    ///
    /// # Panics
    ///
    /// If the reference count would overflow.
    pub fn hold(&mut self) -> AnonRef {
        self.state.ref_cnt = match self.state.ref_cnt.checked_add(1) {
            Some(cnt) => cnt,
            None => {
                error!("Reference count of anon cell {:p} overflows", Arc::as_ptr(self.cell));
                panic!("anon reference count overflow");
            }
        };

        AnonRef::from_cell(self.cell.clone())
    }

    /// Acquires a pin, a reference that does not count as a holder
    pub(crate) fn pin(&mut self) -> AnonPin {
        let anon = self.hold();
        self.state.pins += 1;
        AnonPin { anon }
    }

    /// Releases the lock
    pub fn unlock(self) {}

    /// Decrements the reference count and releases the lock.
    ///
    /// If the count drops to zero the page (if any) goes back to `frames`
    /// after the lock was released.
    fn drop_ref(mut self, frames: &FrameAllocator, pinned: bool) -> bool {
        if pinned {
            self.state.pins = match self.state.pins.checked_sub(1) {
                Some(pins) => pins,
                None => {
                    error!("Pin count of anon cell {:p} underflows", Arc::as_ptr(self.cell));
                    panic!("anon pin count underflow");
                }
            };
        }

        self.state.ref_cnt = match self.state.ref_cnt.checked_sub(1) {
            Some(cnt) => cnt,
            None => {
                error!("Reference count of anon cell {:p} underflows", Arc::as_ptr(self.cell));
                panic!("anon reference count underflow");
            }
        };

        if self.state.ref_cnt > 0 {
            return false;
        }

        let page = self.state.page.take();
        drop(self);

        if let Some(frame) = page {
            trace!("Last anon reference dropped, freeing frame {:#x}", frames.paddr(frame));
            frames.page(frame).clear_flags(PageFlags::ANON);
            frames.free(frame);
        }

        true
    }
}

impl fmt::Debug for AnonGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonGuard")
            .field("ref_cnt", &self.state.ref_cnt)
            .field("pins", &self.state.pins)
            .field("page", &self.state.page)
            .finish()
    }
}
