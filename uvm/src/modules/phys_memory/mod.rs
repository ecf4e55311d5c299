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

mod heap;

pub use heap::HeapPhysMemory;

use crate::page::PhysAddr;

/// Access to the contents of physical memory.
///
/// On real hardware this goes through the kernel's direct map. All ranges
/// passed in lie inside frames the caller currently owns, so implementations
/// do not have to guard against concurrent access to the same bytes.
pub trait PhysMemoryModule: Send + Sync {
    /// Fills `[paddr, paddr + len)` with `value`
    fn fill(&self, paddr: PhysAddr, len: usize, value: u8);

    /// Copies `len` bytes from `src` to `dst`. The ranges never overlap.
    fn copy(&self, src: PhysAddr, dst: PhysAddr, len: usize);

    /// Reads `dest.len()` bytes starting at `paddr`
    fn read(&self, paddr: PhysAddr, dest: &mut [u8]);

    /// Writes `src` starting at `paddr`
    fn write(&self, paddr: PhysAddr, src: &[u8]);

    fn zero(&self, paddr: PhysAddr, len: usize) {
        self.fill(paddr, len, 0);
    }
}
