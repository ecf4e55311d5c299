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

mod simple;

pub use simple::SimpleAddressSpace;

use alloc::sync::Arc;

use crate::{fault::AccessRights, modules::pmap::AddressSpaceId, vm_object::VmObject};

/// Map entry covering one faulting page
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub object: Arc<VmObject>,
    /// Offset of the faulting page inside `object`
    pub offset: u64,
    pub allowed: AccessRights,
}

/// Address-space bookkeeping of the rest of the kernel
pub trait AddressSpaceModule: Send + Sync {
    fn id(&self) -> AddressSpaceId;

    /// Resolves the map entry covering `vaddr`
    fn lookup(&self, vaddr: usize) -> Option<MapEntry>;
}
