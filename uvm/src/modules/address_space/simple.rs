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

use alloc::{collections::BTreeMap, sync::Arc};

use log::debug;
use spin::Mutex;

use super::{AddressSpaceModule, MapEntry};
use crate::{
    error::MmError,
    fault::AccessRights,
    modules::pmap::AddressSpaceId,
    page::PAGE_SIZE,
    util::{ceil_div, page_align_down},
    vm_object::VmObject,
};

struct Region {
    /// Length in bytes, a multiple of the page size
    len: usize,
    object: Arc<VmObject>,
    offset: u64,
    allowed: AccessRights,
}

/// Sorted table of non-overlapping regions
pub struct SimpleAddressSpace {
    id: AddressSpaceId,
    regions: Mutex<BTreeMap<usize, Region>>,
}

impl SimpleAddressSpace {
    pub fn new(id: AddressSpaceId) -> Self {
        Self {
            id,
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Maps `[start, start + len)` to `object` starting at `offset`.
    ///
    /// `start` is rounded down and `len` up to whole pages.
    pub fn map(
        &self,
        start: usize,
        len: usize,
        object: Arc<VmObject>,
        offset: u64,
        allowed: AccessRights,
    ) -> Result<(), MmError> {
        let start = page_align_down(start);
        let len = ceil_div(len, PAGE_SIZE) * PAGE_SIZE;
        let end = start.checked_add(len).ok_or(MmError::RegionOverlap { start })?;

        let mut regions = self.regions.lock();
        let previous_overlaps = regions
            .range(..end)
            .next_back()
            .is_some_and(|(s, r)| s + r.len > start);
        if len == 0 || previous_overlaps {
            return Err(MmError::RegionOverlap { start });
        }

        debug!(
            "{:?}: mapped {:#x}..{:#x} to object {:?} at {:#x}",
            self.id,
            start,
            end,
            object.id(),
            offset
        );
        regions.insert(
            start,
            Region {
                len,
                object,
                offset,
                allowed,
            },
        );
        Ok(())
    }

    /// Removes the region starting at `start` and hands back its object
    pub fn unmap(&self, start: usize) -> Option<Arc<VmObject>> {
        let region = self.regions.lock().remove(&start)?;
        debug!("{:?}: unmapped region at {:#x}", self.id, start);
        Some(region.object)
    }
}

impl AddressSpaceModule for SimpleAddressSpace {
    fn id(&self) -> AddressSpaceId {
        self.id
    }

    fn lookup(&self, vaddr: usize) -> Option<MapEntry> {
        let regions = self.regions.lock();
        let (start, region) = regions.range(..=vaddr).next_back()?;
        if vaddr >= start + region.len {
            return None;
        }

        Some(MapEntry {
            object: region.object.clone(),
            offset: region.offset + (page_align_down(vaddr) - start) as u64,
            allowed: region.allowed,
        })
    }
}
