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

mod anonymous;
mod dummy;

pub use anonymous::AnonymousPagerModule;
pub use dummy::DummyPagerModule;

use crate::{error::MmError, frame_allocator::FrameAllocator, page::FrameNumber, vm_object::VmObject};

/// Strategy that produces pages for offsets of an object that are not
/// resident yet.
///
/// Pagers are stateless. They are called without any lock held and have to
/// insert the page into the object themselves.
pub trait PagerModule: Sync {
    fn pager_type(&self) -> PagerType;

    /// Makes `offset` resident in `object`.
    fn fault(
        &self,
        object: &VmObject,
        offset: u64,
        frames: &FrameAllocator,
    ) -> Result<PagerFill, PagerError>;
}

/// Successful outcome of [`PagerModule::fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerFill {
    /// The pager inserted this frame at the requested offset
    Filled(FrameNumber),
    /// Another fault populated the offset first, look it up again
    Raced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerError {
    /// The pager will never produce a page for this offset
    Unresolvable,
    OutOfMemory,
}

/// Dispatch tag selecting the pager of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PagerType {
    Dummy = 0,
    Anonymous = 1,
}

static DUMMY_PAGER: DummyPagerModule = DummyPagerModule;
static ANONYMOUS_PAGER: AnonymousPagerModule = AnonymousPagerModule;

impl PagerType {
    /// Entry of the dispatch table
    pub fn module(self) -> &'static dyn PagerModule {
        match self {
            PagerType::Dummy => &DUMMY_PAGER,
            PagerType::Anonymous => &ANONYMOUS_PAGER,
        }
    }
}

impl TryFrom<u8> for PagerType {
    type Error = MmError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(PagerType::Dummy),
            1 => Ok(PagerType::Anonymous),
            other => Err(MmError::UnknownPager(other)),
        }
    }
}
