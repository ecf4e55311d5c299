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

use alloc::boxed::Box;

use crate::{
    modules::phys_memory::HeapPhysMemory,
    page::{PhysAddr, PAGE_SIZE},
    uvm_config::UvmConfig,
    FrameAllocator,
};

mod scenario;

/// Frame allocator over heap-backed RAM.
///
/// `segments` holds `(base, frame count)` pairs.
pub(crate) fn get_test_frames(segments: &[(usize, usize)], config: UvmConfig) -> FrameAllocator {
    let regions: alloc::vec::Vec<(PhysAddr, usize)> = segments
        .iter()
        .map(|&(base, count)| (PhysAddr::new(base), count * PAGE_SIZE))
        .collect();

    let frames = FrameAllocator::new(config, Box::new(HeapPhysMemory::new(&regions)));
    for (base, length) in regions.iter() {
        frames.add_segment(*base, *length).unwrap();
    }

    frames
}

pub(crate) fn init_test_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .format_module_path(false)
        .try_init();
}
