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

use std::{error::Error, sync::Arc};

use env_logger::{Builder, Env};
use log::info;
use uvm::{
    modules::{
        address_space::{AddressSpaceModule, SimpleAddressSpace},
        pager::PagerType,
        phys_memory::HeapPhysMemory,
        pmap::{PmapModule, SoftPmap},
    },
    AccessKind, AccessRights, AnonRef, FaultHandler, FrameAllocator, PhysAddr, UvmConfig,
    VmObject, PAGE_SIZE,
};

const HEAP_START: usize = 0x1000_0000;
const SHARED_START: usize = 0x2000_0000;

fn main() -> Result<(), Box<dyn Error>> {
    Builder::from_env(Env::default())
        .filter_level(log::LevelFilter::Debug)
        .format_module_path(false)
        .init();

    // two discontiguous RAM banks
    let banks = [
        (PhysAddr::new(0x10_0000), 16 * PAGE_SIZE),
        (PhysAddr::new(0x80_0000), 8 * PAGE_SIZE),
    ];
    let frames = FrameAllocator::new(UvmConfig::default(), Box::new(HeapPhysMemory::new(&banks)));
    for (base, length) in banks {
        frames.add_segment(base, length)?;
    }

    let pmap = SoftPmap::new();
    let handler = FaultHandler::new(&frames, &pmap);
    let parent_space = SimpleAddressSpace::new(pmap.create_space());
    let child_space = SimpleAddressSpace::new(pmap.create_space());

    // demand-zero heap
    let heap = Arc::new(VmObject::new(PagerType::Anonymous));
    parent_space.map(
        HEAP_START,
        4 * PAGE_SIZE,
        heap.clone(),
        0,
        AccessRights::READ | AccessRights::WRITE,
    )?;
    for page in 0..4 {
        let outcome = handler.page_fault(&parent_space, HEAP_START + page * PAGE_SIZE, AccessKind::Write)?;
        info!("heap page {} at {:#x} ({:?})", page, outcome.paddr, outcome.source);
    }
    let again = handler.page_fault(&parent_space, HEAP_START + 8, AccessKind::Read)?;
    info!("second fault on heap page 0: {:?}", again.source);

    // anonymous memory that is shared with a child
    let shared = Arc::new(VmObject::new(PagerType::Anonymous));
    for page in 0..2u64 {
        if let Err(rejected) = shared.add_anon(page * PAGE_SIZE as u64, AnonRef::alloc()) {
            rejected.release(&frames);
            return Err("offset already populated".into());
        }
    }
    parent_space.map(
        SHARED_START,
        2 * PAGE_SIZE,
        shared.clone(),
        0,
        AccessRights::READ | AccessRights::WRITE,
    )?;
    let written = handler.page_fault(&parent_space, SHARED_START, AccessKind::Write)?;
    frames.memory().write(written.paddr, b"hello from the parent");

    // write-protect before sharing
    pmap.invalidate(parent_space.id(), SHARED_START);
    let child = Arc::new(shared.duplicate(&frames)?);
    child_space.map(
        SHARED_START,
        2 * PAGE_SIZE,
        child.clone(),
        0,
        AccessRights::READ | AccessRights::WRITE,
    )?;

    let seen = handler.page_fault(&child_space, SHARED_START, AccessKind::Read)?;
    let mut buffer = [0u8; 21];
    frames.memory().read(seen.paddr, &mut buffer);
    info!(
        "child reads {:?} from {:#x}",
        String::from_utf8_lossy(&buffer),
        seen.paddr
    );

    let copied = handler.page_fault(&parent_space, SHARED_START, AccessKind::Write)?;
    info!(
        "parent write moved page {:#x} -> {:#x} ({:?})",
        written.paddr, copied.paddr, copied.source
    );

    println!("fault statistics: {:?}", handler.stats());
    println!("frames in use:    {:?}", frames.stats());

    for start in [HEAP_START, SHARED_START] {
        parent_space.unmap(start);
    }
    child_space.unmap(SHARED_START);
    for object in [heap, shared, child] {
        match Arc::try_unwrap(object) {
            Ok(object) => {
                object.free(&frames);
            }
            Err(_) => return Err("object still mapped".into()),
        }
    }

    println!("after teardown:   {:?}", frames.stats());
    Ok(())
}
