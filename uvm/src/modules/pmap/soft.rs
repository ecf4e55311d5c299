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

use alloc::collections::{BTreeMap, BTreeSet};

use log::trace;
use spin::Mutex;

use super::{AddressSpaceId, PmapModule};
use crate::{
    error::PmapError,
    fault::{AccessKind, AccessRights},
    page::PhysAddr,
    util::page_align_down,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Translation {
    paddr: PhysAddr,
    rights: AccessRights,
}

struct SoftPmapInner {
    next_space: u32,
    spaces: BTreeSet<AddressSpaceId>,
    translations: BTreeMap<(AddressSpaceId, usize), Translation>,
    referenced: BTreeSet<PhysAddr>,
    modified: BTreeSet<PhysAddr>,
    max_translations: Option<usize>,
}

/// Page tables kept in software.
///
/// Stands in for the MMU on the host: translations are stored in a map and
/// the referenced/modified bits are only set by [`SoftPmap::simulate_access`].
pub struct SoftPmap {
    inner: Mutex<SoftPmapInner>,
}

impl SoftPmap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SoftPmapInner {
                next_space: 1,
                spaces: BTreeSet::new(),
                translations: BTreeMap::new(),
                referenced: BTreeSet::new(),
                modified: BTreeSet::new(),
                max_translations: None,
            }),
        }
    }

    /// Page tables that run out of memory after `max` translations
    pub fn with_capacity(max: usize) -> Self {
        let pmap = Self::new();
        pmap.inner.lock().max_translations = Some(max);
        pmap
    }

    pub fn create_space(&self) -> AddressSpaceId {
        let mut inner = self.inner.lock();
        let id = AddressSpaceId(inner.next_space);
        inner.next_space += 1;
        inner.spaces.insert(id);
        id
    }

    /// Drops the space and all of its translations
    pub fn destroy_space(&self, space: AddressSpaceId) {
        let mut inner = self.inner.lock();
        inner.spaces.remove(&space);
        inner.translations.retain(|(s, _), _| *s != space);
    }

    /// Physical address and rights `vaddr` currently translates to
    pub fn translate(&self, space: AddressSpaceId, vaddr: usize) -> Option<(PhysAddr, AccessRights)> {
        let inner = self.inner.lock();
        inner
            .translations
            .get(&(space, page_align_down(vaddr)))
            .map(|t| (t.paddr.add(vaddr - page_align_down(vaddr)), t.rights))
    }

    /// Performs the bookkeeping of the MMU for one access.
    ///
    /// Returns `false` if the access would fault.
    pub fn simulate_access(&self, space: AddressSpaceId, vaddr: usize, access: AccessKind) -> bool {
        let mut inner = self.inner.lock();
        let Some(translation) = inner.translations.get(&(space, page_align_down(vaddr))).copied()
        else {
            return false;
        };
        if !translation.rights.contains(access.rights()) {
            return false;
        }

        inner.referenced.insert(translation.paddr);
        if access == AccessKind::Write {
            inner.modified.insert(translation.paddr);
        }
        true
    }

    pub fn mapping_count(&self) -> usize {
        self.inner.lock().translations.len()
    }
}

impl Default for SoftPmap {
    fn default() -> Self {
        Self::new()
    }
}

impl PmapModule for SoftPmap {
    fn install_mapping(
        &self,
        space: AddressSpaceId,
        vaddr: usize,
        paddr: PhysAddr,
        rights: AccessRights,
    ) -> Result<(), PmapError> {
        let mut inner = self.inner.lock();
        if !inner.spaces.contains(&space) {
            return Err(PmapError::NoAddressSpace);
        }

        let key = (space, vaddr);
        if let Some(max) = inner.max_translations {
            if !inner.translations.contains_key(&key) && inner.translations.len() >= max {
                return Err(PmapError::ResourceShortage);
            }
        }

        inner.translations.insert(key, Translation { paddr, rights });
        trace!("{:?}: {:#x} -> {:#x} ({:?})", space, vaddr, paddr, rights);
        Ok(())
    }

    fn invalidate(&self, space: AddressSpaceId, vaddr: usize) {
        self.inner.lock().translations.remove(&(space, vaddr));
    }

    fn invalidate_all(&self, paddr: PhysAddr) {
        let mut inner = self.inner.lock();
        inner.translations.retain(|_, t| t.paddr != paddr);
        trace!("Removed all translations of {:#x}", paddr);
    }

    fn is_referenced(&self, paddr: PhysAddr) -> bool {
        self.inner.lock().referenced.contains(&paddr)
    }

    fn clear_referenced(&self, paddr: PhysAddr) {
        self.inner.lock().referenced.remove(&paddr);
    }

    fn is_modified(&self, paddr: PhysAddr) -> bool {
        self.inner.lock().modified.contains(&paddr)
    }

    fn clear_modified(&self, paddr: PhysAddr) {
        self.inner.lock().modified.remove(&paddr);
    }
}

#[cfg(test)]
mod test {
    use super::SoftPmap;
    use crate::{
        error::PmapError,
        fault::{AccessKind, AccessRights},
        modules::pmap::{AddressSpaceId, PmapModule},
        page::PhysAddr,
    };

    #[test]
    fn test_install_translate_invalidate() {
        let pmap = SoftPmap::new();
        let space = pmap.create_space();

        pmap.install_mapping(space, 0x4000, PhysAddr::new(0x10_2000), AccessRights::READ)
            .unwrap();
        assert_eq!(
            pmap.translate(space, 0x4010),
            Some((PhysAddr::new(0x10_2010), AccessRights::READ))
        );

        pmap.invalidate(space, 0x4000);
        assert_eq!(pmap.translate(space, 0x4000), None);
    }

    #[test]
    fn test_invalidate_all_spaces() {
        let pmap = SoftPmap::new();
        let (first, second) = (pmap.create_space(), pmap.create_space());
        let shared = PhysAddr::new(0x10_0000);
        let other = PhysAddr::new(0x10_1000);

        pmap.install_mapping(first, 0x4000, shared, AccessRights::all())
            .unwrap();
        pmap.install_mapping(second, 0x9000, shared, AccessRights::READ)
            .unwrap();
        pmap.install_mapping(second, 0xa000, other, AccessRights::READ)
            .unwrap();

        pmap.invalidate_all(shared);
        assert_eq!(pmap.translate(first, 0x4000), None);
        assert_eq!(pmap.translate(second, 0x9000), None);
        assert_eq!(pmap.translate(second, 0xa000), Some((other, AccessRights::READ)));
    }

    #[test]
    fn test_unknown_space_and_shortage() {
        let pmap = SoftPmap::with_capacity(1);
        assert_eq!(
            pmap.install_mapping(AddressSpaceId(99), 0, PhysAddr::new(0), AccessRights::READ),
            Err(PmapError::NoAddressSpace)
        );

        let space = pmap.create_space();
        pmap.install_mapping(space, 0, PhysAddr::new(0), AccessRights::READ)
            .unwrap();
        // replacing an existing translation needs no extra memory
        pmap.install_mapping(space, 0, PhysAddr::new(0x1000), AccessRights::all())
            .unwrap();
        assert_eq!(
            pmap.install_mapping(space, 0x1000, PhysAddr::new(0), AccessRights::READ),
            Err(PmapError::ResourceShortage)
        );

        pmap.destroy_space(space);
        assert_eq!(pmap.mapping_count(), 0);
    }

    #[test]
    fn test_simulated_access_bits() {
        let pmap = SoftPmap::new();
        let space = pmap.create_space();
        let paddr = PhysAddr::new(0x10_0000);
        pmap.install_mapping(space, 0x8000, paddr, AccessRights::READ)
            .unwrap();

        assert!(!pmap.simulate_access(space, 0x8008, AccessKind::Write));
        assert!(!pmap.is_referenced(paddr));

        assert!(pmap.simulate_access(space, 0x8008, AccessKind::Read));
        assert!(pmap.is_referenced(paddr));
        assert!(!pmap.is_modified(paddr));

        pmap.install_mapping(space, 0x8000, paddr, AccessRights::READ | AccessRights::WRITE)
            .unwrap();
        assert!(pmap.simulate_access(space, 0x8000, AccessKind::Write));
        assert!(pmap.is_modified(paddr));

        pmap.clear_referenced(paddr);
        pmap.clear_modified(paddr);
        assert!(!pmap.is_referenced(paddr));
        assert!(!pmap.is_modified(paddr));
    }
}
