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

use alloc::sync::Arc;

use crate::{
    error::FaultError,
    fault::{AccessKind, AccessRights, FaultHandler, FaultSource},
    modules::{
        address_space::{AddressSpaceModule, SimpleAddressSpace},
        pager::PagerType,
        pmap::SoftPmap,
    },
    page::PAGE_SIZE,
    test::{get_test_frames, init_test_logger},
    uvm_config::UvmConfig,
    vm_object::VmObject,
};

const REGION: usize = 0x4000_0000;

#[test]
fn test_anonymous_object_end_to_end() {
    init_test_logger();

    let frames = get_test_frames(&[(0x10_0000, 8), (0x80_0000, 8)], UvmConfig::default());
    let pmap = SoftPmap::new();
    let space = pmap.create_space();
    let handler = FaultHandler::new(&frames, &pmap);
    let object = VmObject::new(PagerType::Anonymous);

    let first = handler
        .resolve(space, REGION, &object, 0, AccessKind::Read)
        .unwrap();
    assert_eq!(first.source, FaultSource::PagerFill);
    assert_eq!(object.find_page(0), Some(first.frame));

    let mut contents = [0xffu8; PAGE_SIZE];
    frames.memory().read(first.paddr, &mut contents);
    assert!(contents.iter().all(|b| *b == 0));

    // second fault finds the same page, nothing new is allocated
    let outstanding = frames.stats().outstanding_runs;
    let second = handler
        .resolve(space, REGION, &object, 0, AccessKind::Read)
        .unwrap();
    assert_eq!(second.frame, first.frame);
    assert_eq!(second.source, FaultSource::Resident);
    assert_eq!(frames.stats().outstanding_runs, outstanding);

    for i in 1..5u64 {
        handler
            .resolve(
                space,
                REGION + i as usize * PAGE_SIZE,
                &object,
                i * PAGE_SIZE as u64,
                AccessKind::Write,
            )
            .unwrap();
    }
    assert_eq!(object.resident_count(), 5);

    let stats = handler.stats();
    assert_eq!(stats.pager_fills, 5);
    assert_eq!(stats.resident_hits, 1);
    assert_eq!(stats.failures, 0);

    let free_before = frames.stats().free_frames;
    let held = object.resident_count();
    assert_eq!(object.free(&frames), held);
    assert_eq!(frames.stats().free_frames, free_before + held);
}

#[test]
fn test_dummy_pager_never_resolves() {
    init_test_logger();

    let frames = get_test_frames(&[(0x10_0000, 4)], UvmConfig::default());
    let pmap = SoftPmap::new();
    let space = pmap.create_space();
    let handler = FaultHandler::new(&frames, &pmap);
    let object = VmObject::new(PagerType::Dummy);

    for (offset, access) in [
        (0, AccessKind::Read),
        (PAGE_SIZE as u64, AccessKind::Write),
        (0, AccessKind::Execute),
    ] {
        assert_eq!(
            handler.resolve(space, REGION, &object, offset, access),
            Err(FaultError::Unresolvable { offset })
        );
    }

    assert_eq!(object.resident_count(), 0);
    assert_eq!(frames.stats().allocated_frames, 0);
    assert_eq!(pmap.mapping_count(), 0);
    assert_eq!(handler.stats().failures, 3);
}

#[test]
fn test_page_fault_through_address_space() {
    init_test_logger();

    let frames = get_test_frames(&[(0x10_0000, 8)], UvmConfig::default());
    let pmap = SoftPmap::new();
    let space = SimpleAddressSpace::new(pmap.create_space());
    let handler = FaultHandler::new(&frames, &pmap);

    let data = Arc::new(VmObject::new(PagerType::Anonymous));
    let text = Arc::new(VmObject::new(PagerType::Anonymous));
    space
        .map(REGION, 4 * PAGE_SIZE, data.clone(), 0, AccessRights::READ | AccessRights::WRITE)
        .unwrap();
    // same object twice, at different offsets
    space
        .map(
            REGION + 0x10_0000,
            2 * PAGE_SIZE,
            text.clone(),
            0,
            AccessRights::READ | AccessRights::EXECUTE,
        )
        .unwrap();
    space
        .map(
            REGION + 0x20_0000,
            PAGE_SIZE,
            text.clone(),
            PAGE_SIZE as u64,
            AccessRights::READ,
        )
        .unwrap();

    let written = handler
        .page_fault(&space, REGION + 2 * PAGE_SIZE + 40, AccessKind::Write)
        .unwrap();
    assert_eq!(data.find_page(2 * PAGE_SIZE as u64), Some(written.frame));
    assert!(pmap.simulate_access(space.id(), REGION + 2 * PAGE_SIZE, AccessKind::Write));

    let executed = handler
        .page_fault(&space, REGION + 0x10_0000 + PAGE_SIZE, AccessKind::Execute)
        .unwrap();
    let aliased = handler
        .page_fault(&space, REGION + 0x20_0000, AccessKind::Read)
        .unwrap();
    assert_eq!(executed.frame, aliased.frame);
    assert_eq!(aliased.source, FaultSource::Resident);

    assert_eq!(
        handler.page_fault(&space, REGION + 0x20_0000, AccessKind::Write),
        Err(FaultError::ProtectionViolation {
            vaddr: REGION + 0x20_0000
        })
    );
    assert_eq!(
        handler.page_fault(&space, REGION + 4 * PAGE_SIZE, AccessKind::Read),
        Err(FaultError::NotMapped {
            vaddr: REGION + 4 * PAGE_SIZE
        })
    );

    // tear down: the address space drops its references, then the objects go
    for start in [REGION, REGION + 0x10_0000, REGION + 0x20_0000] {
        space.unmap(start).unwrap();
    }
    for object in [data, text] {
        Arc::try_unwrap(object).unwrap().free(&frames);
    }
    assert_eq!(frames.stats().allocated_frames, 0);
}
