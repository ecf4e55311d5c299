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

use log::{trace, warn};

use super::{PagerError, PagerFill, PagerModule, PagerType};
use crate::{
    frame_allocator::{AllocOptions, FrameAllocator},
    vm_object::VmObject,
};

/// Demand-zero pager: every missing offset gets a fresh zero-filled frame
pub struct AnonymousPagerModule;

impl PagerModule for AnonymousPagerModule {
    fn pager_type(&self) -> PagerType {
        PagerType::Anonymous
    }

    fn fault(
        &self,
        object: &VmObject,
        offset: u64,
        frames: &FrameAllocator,
    ) -> Result<PagerFill, PagerError> {
        // allocate without the object lock, only the insertion is serialized
        let frame = frames
            .alloc(1, AllocOptions::zeroed())
            .map_err(|_| PagerError::OutOfMemory)?;

        if !object.insert_if_vacant(offset, frame, frames) {
            warn!(
                "Lost race for offset {:#x} of object {:?}, dropping fresh frame",
                offset,
                object.id()
            );
            frames.free(frame);
            return Ok(PagerFill::Raced);
        }

        trace!(
            "Zero-filled {:#x} for offset {:#x} of object {:?}",
            frames.paddr(frame),
            offset,
            object.id()
        );
        Ok(PagerFill::Filled(frame))
    }
}
