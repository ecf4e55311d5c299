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

use alloc::{boxed::Box, vec, vec::Vec};
use core::ops::Range;

use spin::Mutex;

use super::PhysMemoryModule;
use crate::page::PhysAddr;

struct RamRegion {
    base: usize,
    len: usize,
    bytes: Mutex<Box<[u8]>>,
}

impl RamRegion {
    fn local_range(&self, paddr: PhysAddr, len: usize) -> Option<Range<usize>> {
        let start = paddr.as_usize().checked_sub(self.base)?;
        let end = start.checked_add(len)?;
        (end <= self.len).then_some(start..end)
    }
}

/// RAM image kept on the heap, one buffer per physical segment.
///
/// Used to run the memory-management core outside of a kernel. Accessing an
/// address outside of every region panics.
pub struct HeapPhysMemory {
    regions: Vec<RamRegion>,
}

impl HeapPhysMemory {
    /// Creates zero-initialized buffers for every `(base, length)` pair
    pub fn new(regions: &[(PhysAddr, usize)]) -> Self {
        Self {
            regions: regions
                .iter()
                .map(|&(base, length)| RamRegion {
                    base: base.as_usize(),
                    len: length,
                    bytes: Mutex::new(vec![0u8; length].into_boxed_slice()),
                })
                .collect(),
        }
    }

    fn with_range<R>(&self, paddr: PhysAddr, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        for region in self.regions.iter() {
            if let Some(range) = region.local_range(paddr, len) {
                let mut bytes = region.bytes.lock();
                return f(&mut bytes[range]);
            }
        }

        panic!(
            "physical range {:#x}+{:#x} is not backed by any RAM region",
            paddr, len
        );
    }
}

impl PhysMemoryModule for HeapPhysMemory {
    fn fill(&self, paddr: PhysAddr, len: usize, value: u8) {
        self.with_range(paddr, len, |bytes| bytes.fill(value));
    }

    fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize) {
        // src and dst may live in the same region, so never hold two locks
        let mut buffer = vec![0u8; len];
        self.read(src, &mut buffer);
        self.write(dst, &buffer);
    }

    fn read(&self, paddr: PhysAddr, dest: &mut [u8]) {
        self.with_range(paddr, dest.len(), |bytes| dest.copy_from_slice(bytes));
    }

    fn write(&self, paddr: PhysAddr, src: &[u8]) {
        self.with_range(paddr, src.len(), |bytes| bytes.copy_from_slice(src));
    }
}
