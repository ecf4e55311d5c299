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

mod soft;

pub use soft::SoftPmap;

use crate::{error::PmapError, fault::AccessRights, page::PhysAddr};

/// Identifies the hardware address space (page table root) of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u32);

/// Architecture page-table layer.
///
/// `vaddr` is always page aligned. The referenced and modified accessors
/// report the hardware bits of every translation pointing at `paddr`.
pub trait PmapModule: Send + Sync {
    /// Creates or replaces the translation of `vaddr` in `space`
    fn install_mapping(
        &self,
        space: AddressSpaceId,
        vaddr: usize,
        paddr: PhysAddr,
        rights: AccessRights,
    ) -> Result<(), PmapError>;

    /// Removes the translation of `vaddr` and flushes it from the TLB
    fn invalidate(&self, space: AddressSpaceId, vaddr: usize);

    /// Removes every translation pointing at `paddr`, in all address spaces
    fn invalidate_all(&self, paddr: PhysAddr);

    fn is_referenced(&self, paddr: PhysAddr) -> bool;

    fn clear_referenced(&self, paddr: PhysAddr);

    fn is_modified(&self, paddr: PhysAddr) -> bool;

    fn clear_modified(&self, paddr: PhysAddr);
}
