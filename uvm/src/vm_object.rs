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

//! Backing-store objects.
//!
//! An object owns the pages of one reusable memory region, indexed by their
//! offset inside the object. Offsets are independent of any virtual address
//! the object is mapped at. An offset either holds a page owned directly by
//! the object or a reference to an anonymous memory cell.

use alloc::{collections::BTreeMap, vec::Vec};
use core::{
    fmt,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::{
    anon::{AnonPin, AnonRef},
    error::MmError,
    frame_allocator::{AllocOptions, FrameAllocator},
    modules::pager::{PagerModule, PagerType},
    page::{FrameNumber, PAGE_SIZE},
    util::{fail_on_leak, is_page_aligned},
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an object, used as the weak back-reference from pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    fn next() -> Self {
        let raw = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        // 2^64 objects are never created
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0.get()
    }
}

/// What an object holds at one offset
pub enum ObjectPage {
    /// Page owned by the object itself
    Resident(FrameNumber),
    /// Reference to a (possibly shared) anonymous cell
    Anon(AnonRef),
}

impl fmt::Debug for ObjectPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectPage::Resident(frame) => write!(f, "Resident({})", frame.index()),
            ObjectPage::Anon(anon) => write!(f, "{:?}", anon),
        }
    }
}

/// Result of a lookup used by the fault handler
pub(crate) enum PageLookup {
    Resident(FrameNumber),
    /// Pin on the cell, held on behalf of the caller
    Anon(AnonPin),
}

struct ObjectInner {
    pages: BTreeMap<u64, ObjectPage>,
    /// Offsets in the order they were inserted
    insertion_order: Vec<u64>,
}

impl ObjectInner {
    fn empty() -> Self {
        Self {
            pages: BTreeMap::new(),
            insertion_order: Vec::new(),
        }
    }

    fn insert(&mut self, offset: u64, page: ObjectPage) {
        self.pages.insert(offset, page);
        self.insertion_order.push(offset);
    }

    fn remove(&mut self, offset: u64) -> Option<ObjectPage> {
        let page = self.pages.remove(&offset)?;
        self.insertion_order.retain(|o| *o != offset);
        Some(page)
    }
}

/// Backing-store object
pub struct VmObject {
    id: ObjectId,
    pager: PagerType,
    inner: Mutex<ObjectInner>,
}

impl VmObject {
    /// Creates an empty object served by `pager`
    pub fn new(pager: PagerType) -> Self {
        let object = Self {
            id: ObjectId::next(),
            pager,
            inner: Mutex::new(ObjectInner::empty()),
        };

        debug!("Created object {:?} with {:?} pager", object.id, pager);
        object
    }

    /// Creates an empty object from a raw pager tag.
    ///
    /// Fails if no pager is registered for `tag`.
    pub fn alloc(tag: u8) -> Result<Self, MmError> {
        Ok(Self::new(PagerType::try_from(tag)?))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn pager_type(&self) -> PagerType {
        self.pager
    }

    pub fn pager(&self) -> &'static dyn PagerModule {
        self.pager.module()
    }

    /// Number of offsets holding a page or a cell
    pub fn resident_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Occupied offsets in insertion order
    pub fn resident_offsets(&self) -> Vec<u64> {
        self.inner.lock().insertion_order.clone()
    }

    /// Inserts `frame` at `offset` and makes the page point back to this
    /// object.
    ///
    /// An occupied offset is never overwritten: the call fails without
    /// touching the existing page.
    pub fn add_page(
        &self,
        offset: u64,
        frame: FrameNumber,
        frames: &FrameAllocator,
    ) -> Result<(), MmError> {
        debug_assert!(is_page_aligned(offset), "unaligned offset {:#x}", offset);

        let mut inner = self.inner.lock();
        if inner.pages.contains_key(&offset) {
            warn!(
                "Rejected second page at offset {:#x} of object {:?}",
                offset, self.id
            );
            return Err(MmError::OffsetOccupied { offset });
        }

        frames.page(frame).set_owner(self.id, offset);
        inner.insert(offset, ObjectPage::Resident(frame));

        trace!("Object {:?}: page {:#x} added at {:#x}", self.id, frames.paddr(frame), offset);
        Ok(())
    }

    /// Inserts a reference to an anonymous cell at `offset`.
    ///
    /// The object takes over the reference. If `offset` is occupied the
    /// reference is handed back unchanged.
    pub fn add_anon(&self, offset: u64, anon: AnonRef) -> Result<(), AnonRef> {
        debug_assert!(is_page_aligned(offset), "unaligned offset {:#x}", offset);

        let mut inner = self.inner.lock();
        if inner.pages.contains_key(&offset) {
            warn!(
                "Rejected anon cell at occupied offset {:#x} of object {:?}",
                offset, self.id
            );
            return Err(anon);
        }

        inner.insert(offset, ObjectPage::Anon(anon));
        Ok(())
    }

    /// Detaches `frame` from this object and clears its back-reference.
    ///
    /// The frame is not freed, that is up to the caller. Returns `false` if
    /// the frame is not resident in this object.
    pub fn remove_page(&self, frame: FrameNumber, frames: &FrameAllocator) -> bool {
        let page = frames.page(frame);
        let Some((owner, offset)) = page.owner() else {
            return false;
        };
        if owner != self.id {
            return false;
        }

        let mut inner = self.inner.lock();
        match inner.pages.get(&offset) {
            Some(ObjectPage::Resident(resident)) if *resident == frame => {}
            _ => return false,
        }

        inner.remove(offset);
        page.clear_owner();

        trace!("Object {:?}: page {:#x} removed from {:#x}", self.id, page.paddr(), offset);
        true
    }

    /// Detaches the anonymous cell at `offset` and hands its reference to the
    /// caller
    pub fn remove_anon(&self, offset: u64) -> Option<AnonRef> {
        let mut inner = self.inner.lock();
        if !matches!(inner.pages.get(&offset), Some(ObjectPage::Anon(_))) {
            return None;
        }

        match inner.remove(offset) {
            Some(ObjectPage::Anon(anon)) => Some(anon),
            _ => None,
        }
    }

    /// Frame backing `offset`, if any.
    ///
    /// For offsets holding an anonymous cell this is the cell's page, which
    /// may not exist yet.
    pub fn find_page(&self, offset: u64) -> Option<FrameNumber> {
        let inner = self.inner.lock();
        let frame = match inner.pages.get(&offset)? {
            ObjectPage::Resident(frame) => Some(*frame),
            ObjectPage::Anon(anon) => anon.lock().page(),
        };
        frame
    }

    /// Looks up `offset`, pinning anonymous cells so that they stay alive
    /// after the object lock is released
    pub(crate) fn lookup(&self, offset: u64) -> Option<PageLookup> {
        let inner = self.inner.lock();
        let found = match inner.pages.get(&offset)? {
            ObjectPage::Resident(frame) => PageLookup::Resident(*frame),
            ObjectPage::Anon(anon) => PageLookup::Anon(anon.lock().pin()),
        };
        Some(found)
    }

    /// Inserts `frame` unless `offset` got occupied in the meantime.
    ///
    /// Used by pagers that produced a page without holding the object lock.
    /// Returns `false` if another fault won the race; the caller still owns
    /// `frame` in that case.
    pub(crate) fn insert_if_vacant(
        &self,
        offset: u64,
        frame: FrameNumber,
        frames: &FrameAllocator,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.pages.contains_key(&offset) {
            return false;
        }

        frames.page(frame).set_owner(self.id, offset);
        inner.insert(offset, ObjectPage::Resident(frame));
        true
    }

    /// Runs `f` while `offset` is known to reference the cell `expected`.
    ///
    /// Returns `None` without calling `f` if the offset moved on to another
    /// cell. `f` must not lock this object, locking cells is fine.
    pub(crate) fn with_current_anon<R>(
        &self,
        offset: u64,
        expected: &AnonRef,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let inner = self.inner.lock();
        match inner.pages.get(&offset) {
            Some(ObjectPage::Anon(current)) if current.same_cell(expected) => Some(f()),
            _ => None,
        }
    }

    /// Replaces the cell `expected` at `offset` with `replacement` and runs
    /// `f` before anybody else can look the offset up.
    ///
    /// Returns the object's old reference on success. If the offset no
    /// longer holds `expected`, `replacement` is handed back. `f` must not
    /// lock this object.
    pub(crate) fn replace_anon<R>(
        &self,
        offset: u64,
        expected: &AnonRef,
        replacement: AnonRef,
        f: impl FnOnce() -> R,
    ) -> Result<(AnonRef, R), AnonRef> {
        let mut inner = self.inner.lock();
        match inner.pages.get_mut(&offset) {
            Some(ObjectPage::Anon(current)) if current.same_cell(expected) => {
                let old = core::mem::replace(current, replacement);
                Ok((old, f()))
            }
            _ => Err(replacement),
        }
    }

    /// Creates a child object bound to the same pager.
    ///
    /// Anonymous cells are shared with the child (one more reference each),
    /// pages owned directly by this object are copied eagerly. Callers have
    /// to keep other threads from removing pages of `self` meanwhile.
    pub fn duplicate(&self, frames: &FrameAllocator) -> Result<VmObject, MmError> {
        let snapshot: Vec<(u64, ObjectPage)> = {
            let inner = self.inner.lock();
            inner
                .insertion_order
                .iter()
                .map(|offset| {
                    let entry = match &inner.pages[offset] {
                        ObjectPage::Resident(frame) => ObjectPage::Resident(*frame),
                        // becomes the child's reference
                        ObjectPage::Anon(anon) => ObjectPage::Anon(anon.lock().hold()),
                    };
                    (*offset, entry)
                })
                .collect()
        };

        let child = VmObject::new(self.pager);
        let mut failure = None;

        for (offset, entry) in snapshot {
            match entry {
                ObjectPage::Anon(shared) => {
                    if let Err(shared) = child.add_anon(offset, shared) {
                        shared.release(frames);
                    }
                }
                ObjectPage::Resident(_) if failure.is_some() => {}
                ObjectPage::Resident(frame) => {
                    let copy = match frames.alloc(1, AllocOptions::default()) {
                        Ok(copy) => copy,
                        Err(err) => {
                            // keep going, the remaining holds have to be handed over
                            failure = Some(err);
                            continue;
                        }
                    };
                    frames
                        .memory()
                        .copy(frames.paddr(frame), frames.paddr(copy), PAGE_SIZE);
                    if child.add_page(offset, copy, frames).is_err() {
                        frames.free(copy);
                    }
                }
            }
        }

        if let Some(err) = failure {
            warn!("Duplicating object {:?} failed: {}", self.id, err);
            child.free(frames);
            return Err(err);
        }

        debug!(
            "Duplicated object {:?} into {:?} ({} offsets)",
            self.id,
            child.id,
            child.resident_count()
        );
        Ok(child)
    }

    /// Destroys the object.
    ///
    /// Pages owned by the object go back to `frames`, references to
    /// anonymous cells are dropped (the cells themselves only go away with
    /// their last reference). Returns how many frames were freed directly.
    pub fn free(mut self, frames: &FrameAllocator) -> usize {
        let inner = core::mem::replace(self.inner.get_mut(), ObjectInner::empty());
        let mut freed = 0;

        for offset in inner.insertion_order.iter() {
            match inner.pages.get(offset) {
                Some(ObjectPage::Resident(frame)) => {
                    frames.page(*frame).clear_owner();
                    frames.free(*frame);
                    freed += 1;
                }
                Some(ObjectPage::Anon(_)) | None => {}
            }
        }

        let mut cells = 0;
        for (_, page) in inner.pages.into_iter() {
            if let ObjectPage::Anon(anon) = page {
                anon.release(frames);
                cells += 1;
            }
        }

        debug!(
            "Freed object {:?}: {} page(s) returned, {} anon reference(s) dropped",
            self.id, freed, cells
        );
        freed
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let occupied = self.inner.get_mut().pages.len();
        if occupied == 0 {
            return;
        }

        error!(
            "Object {:?} dropped with {} occupied offset(s) instead of being freed",
            self.id, occupied
        );
        fail_on_leak("object dropped without free");
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("pager", &self.pager)
            .finish_non_exhaustive()
    }
}
