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

use log::warn;

use super::{PagerError, PagerFill, PagerModule, PagerType};
use crate::{frame_allocator::FrameAllocator, vm_object::VmObject};

/// Pager for objects that must be fully populated up front.
///
/// Every fault is unresolvable.
pub struct DummyPagerModule;

impl PagerModule for DummyPagerModule {
    fn pager_type(&self) -> PagerType {
        PagerType::Dummy
    }

    fn fault(
        &self,
        object: &VmObject,
        offset: u64,
        _frames: &FrameAllocator,
    ) -> Result<PagerFill, PagerError> {
        warn!(
            "Fault at offset {:#x} of object {:?} reached the dummy pager",
            offset,
            object.id()
        );
        Err(PagerError::Unresolvable)
    }
}
