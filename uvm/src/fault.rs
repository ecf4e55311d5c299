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

//! Page fault handling.
//!
//! A fault is resolved in three steps: look the offset up in the object,
//! ask the object's pager if it is missing, and install the translation.
//! No lock is held while the pager runs. Translations of anonymous pages
//! are installed while the object lock is held, which orders them against a
//! concurrent copy-on-write of the same offset.
//!
//! A write to an anonymous cell held by more than one object copies the
//! page. Only holders count: the pins concurrent faults take on the cell do
//! not make it shared. Replacing the shared page removes all of its
//! translations.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::{
    anon::{AnonPin, AnonRef},
    error::FaultError,
    frame_allocator::{AllocOptions, FrameAllocator},
    modules::{
        address_space::AddressSpaceModule,
        pager::{PagerError, PagerFill},
        pmap::{AddressSpaceId, PmapModule},
    },
    page::{FrameNumber, PageFlags, PhysAddr, PAGE_SIZE},
    util::page_align_down,
    vm_object::{PageLookup, VmObject},
};

bitflags! {
    /// Rights of a translation or a map entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Kind of access that caused a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Rights a translation needs for this access
    pub fn rights(self) -> AccessRights {
        match self {
            AccessKind::Read => AccessRights::READ,
            AccessKind::Write => AccessRights::READ | AccessRights::WRITE,
            AccessKind::Execute => AccessRights::READ | AccessRights::EXECUTE,
        }
    }
}

/// Where the page of a resolved fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSource {
    /// Already resident in the object
    Resident,
    /// Produced by the object's pager
    PagerFill,
    /// Backed by an anonymous cell (filled on demand if it had no page)
    Anon,
    /// Private copy of a shared anonymous page
    CopyOnWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultOutcome {
    pub frame: FrameNumber,
    pub paddr: PhysAddr,
    pub source: FaultSource,
    /// Rights of the installed translation
    pub rights: AccessRights,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub resident_hits: u64,
    pub pager_fills: u64,
    pub anon_fills: u64,
    pub cow_copies: u64,
    pub lost_races: u64,
    pub failures: u64,
}

#[derive(Default)]
struct FaultCounters {
    resident_hits: AtomicU64,
    pager_fills: AtomicU64,
    anon_fills: AtomicU64,
    cow_copies: AtomicU64,
    lost_races: AtomicU64,
    failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of the anonymous path that needs another pass
enum AnonStep {
    Done(FaultOutcome),
    Retry,
}

pub struct FaultHandler<'a, P: PmapModule> {
    frames: &'a FrameAllocator,
    pmap: &'a P,
    counters: FaultCounters,
}

impl<'a, P: PmapModule> FaultHandler<'a, P> {
    pub fn new(frames: &'a FrameAllocator, pmap: &'a P) -> Self {
        Self {
            frames,
            pmap,
            counters: FaultCounters::default(),
        }
    }

    /// Resolves a fault at `vaddr` of `space` through its map entry
    pub fn page_fault<S: AddressSpaceModule>(
        &self,
        space: &S,
        vaddr: usize,
        access: AccessKind,
    ) -> Result<FaultOutcome, FaultError> {
        let Some(entry) = space.lookup(vaddr) else {
            bump(&self.counters.failures);
            warn!("{:?}: no mapping covers {:#x}", space.id(), vaddr);
            return Err(FaultError::NotMapped { vaddr });
        };

        if !entry.allowed.contains(access.rights()) {
            bump(&self.counters.failures);
            warn!(
                "{:?}: {:?} access to {:#x} not allowed ({:?})",
                space.id(),
                access,
                vaddr,
                entry.allowed
            );
            return Err(FaultError::ProtectionViolation { vaddr });
        }

        self.resolve(space.id(), vaddr, &entry.object, entry.offset, access)
    }

    /// Makes `offset` of `object` resident and maps it at `vaddr`.
    ///
    /// Concurrent faults on the same offset end up with the same page.
    pub fn resolve(
        &self,
        space: AddressSpaceId,
        vaddr: usize,
        object: &VmObject,
        offset: u64,
        access: AccessKind,
    ) -> Result<FaultOutcome, FaultError> {
        let vaddr = page_align_down(vaddr);
        trace!(
            "{:?} fault at {:#x} (object {:?}, offset {:#x})",
            access,
            vaddr,
            object.id(),
            offset
        );

        loop {
            match object.lookup(offset) {
                Some(PageLookup::Resident(frame)) => {
                    bump(&self.counters.resident_hits);
                    return self.install(space, vaddr, frame, access, FaultSource::Resident);
                }
                Some(PageLookup::Anon(pin)) => {
                    match self.resolve_anon(space, vaddr, object, offset, pin, access)? {
                        AnonStep::Done(outcome) => return Ok(outcome),
                        AnonStep::Retry => continue,
                    }
                }
                None => {}
            }

            match object.pager().fault(object, offset, self.frames) {
                Ok(PagerFill::Filled(frame)) => {
                    bump(&self.counters.pager_fills);
                    return self.install(space, vaddr, frame, access, FaultSource::PagerFill);
                }
                Ok(PagerFill::Raced) => {
                    // the winner's page is resident now
                    bump(&self.counters.lost_races);
                }
                Err(PagerError::Unresolvable) => {
                    bump(&self.counters.failures);
                    return Err(FaultError::Unresolvable { offset });
                }
                Err(PagerError::OutOfMemory) => {
                    bump(&self.counters.failures);
                    return Err(FaultError::OutOfMemory);
                }
            }
        }
    }

    /// `pin` was taken by the lookup and is released on every path out of
    /// here
    fn resolve_anon(
        &self,
        space: AddressSpaceId,
        vaddr: usize,
        object: &VmObject,
        offset: u64,
        pin: AnonPin,
        access: AccessKind,
    ) -> Result<AnonStep, FaultError> {
        let mut guard = pin.lock();

        let frame = match guard.page() {
            Some(frame) => frame,
            None => match self.frames.alloc(1, AllocOptions::zeroed()) {
                Ok(frame) => {
                    guard.set_page(frame, self.frames);
                    bump(&self.counters.anon_fills);
                    frame
                }
                Err(_) => {
                    guard.unlock();
                    pin.release(self.frames);
                    bump(&self.counters.failures);
                    return Err(FaultError::OutOfMemory);
                }
            },
        };

        // pins of concurrent faults are not holders
        if access != AccessKind::Write || guard.holder_count() <= 1 {
            guard.unlock();
            // a copy-on-write fault may have replaced the cell meanwhile, and
            // a duplicate may have shared it
            let installed = object.with_current_anon(offset, pin.anon(), || {
                if access == AccessKind::Write && pin.lock().holder_count() > 1 {
                    return None;
                }
                Some(self.install(space, vaddr, frame, access, FaultSource::Anon))
            });
            pin.release(self.frames);

            return match installed.flatten() {
                Some(result) => result.map(AnonStep::Done),
                None => {
                    bump(&self.counters.lost_races);
                    Ok(AnonStep::Retry)
                }
            };
        }

        // shared and written to: give this object a private copy
        let copy = match self.frames.alloc(1, AllocOptions::default()) {
            Ok(copy) => copy,
            Err(_) => {
                guard.unlock();
                pin.release(self.frames);
                bump(&self.counters.failures);
                return Err(FaultError::OutOfMemory);
            }
        };
        let shared_paddr = self.frames.paddr(frame);
        self.frames
            .memory()
            .copy(shared_paddr, self.frames.paddr(copy), PAGE_SIZE);
        guard.unlock();

        let private = AnonRef::alloc();
        private.lock().set_page(copy, self.frames);

        let replaced = object.replace_anon(offset, pin.anon(), private, || {
            // translations of the shared page in other spaces mapping this
            // object would outlive the object's reference
            self.pmap.invalidate_all(shared_paddr);
            self.install(space, vaddr, copy, access, FaultSource::CopyOnWrite)
        });
        pin.release(self.frames);

        match replaced {
            Ok((shared, result)) => {
                shared.release(self.frames);
                bump(&self.counters.cow_copies);
                debug!(
                    "Copied shared page {:#x} to {:#x} for offset {:#x} of object {:?}",
                    shared_paddr,
                    self.frames.paddr(copy),
                    offset,
                    object.id()
                );
                result.map(AnonStep::Done)
            }
            Err(private) => {
                // another fault replaced the cell first
                private.release(self.frames);
                bump(&self.counters.lost_races);
                Ok(AnonStep::Retry)
            }
        }
    }

    fn install(
        &self,
        space: AddressSpaceId,
        vaddr: usize,
        frame: FrameNumber,
        access: AccessKind,
        source: FaultSource,
    ) -> Result<FaultOutcome, FaultError> {
        let paddr = self.frames.paddr(frame);
        let rights = access.rights();

        if let Err(err) = self.pmap.install_mapping(space, vaddr, paddr, rights) {
            bump(&self.counters.failures);
            warn!("Installing {:#x} -> {:#x} failed: {}", vaddr, paddr, err);
            return Err(err.into());
        }

        let mut flags = PageFlags::REFERENCED;
        if access == AccessKind::Write {
            flags |= PageFlags::MODIFIED;
        }
        self.frames.page(frame).set_flags(flags);

        Ok(FaultOutcome {
            frame,
            paddr,
            source,
            rights,
        })
    }

    /// Folds the hardware referenced/modified bits of `frame` into its
    /// descriptor and clears them in the pmap
    pub fn sync_page_flags(&self, frame: FrameNumber) -> PageFlags {
        let page = self.frames.page(frame);
        let paddr = page.paddr();

        if self.pmap.is_referenced(paddr) {
            page.set_flags(PageFlags::REFERENCED);
            self.pmap.clear_referenced(paddr);
        }
        if self.pmap.is_modified(paddr) {
            page.set_flags(PageFlags::MODIFIED);
            self.pmap.clear_modified(paddr);
        }

        page.flags()
    }

    pub fn stats(&self) -> FaultStats {
        let c = &self.counters;
        FaultStats {
            resident_hits: c.resident_hits.load(Ordering::Relaxed),
            pager_fills: c.pager_fills.load(Ordering::Relaxed),
            anon_fills: c.anon_fills.load(Ordering::Relaxed),
            cow_copies: c.cow_copies.load(Ordering::Relaxed),
            lost_races: c.lost_races.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}
