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

//! Physical frame allocator.
//!
//! Physical RAM is registered as a set of disjoint segments. Once the first
//! frame is allocated (or looked up) the segment list is sealed and one
//! [`Page`] descriptor per frame is created in a single arena that is never
//! resized afterwards. Free frames are found with a first-fit scan that
//! starts at a per-segment hint.

use alloc::{boxed::Box, vec::Vec};

use log::{debug, error, trace};
use spin::{Mutex, Once};

use crate::{
    error::MmError,
    modules::phys_memory::PhysMemoryModule,
    page::{FrameNumber, Page, PageFlags, PhysAddr, PAGE_SHIFT, PAGE_SIZE},
    util::pages_in,
    uvm_config::{UvmConfig, POISON_BYTE},
};

/// Options for [`FrameAllocator::alloc`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocOptions {
    /// Zero the contents and clear the hardware mirror bits
    pub zero: bool,
}

impl AllocOptions {
    pub const fn zeroed() -> Self {
        Self { zero: true }
    }
}

/// Snapshot of the allocator's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
    /// Frames currently handed out
    pub allocated_frames: usize,
    /// Runs currently handed out
    pub outstanding_runs: usize,
    pub failed_allocations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    base: PhysAddr,
    frames: usize,
    /// Frame number of the first frame of this segment
    first: usize,
}

impl Segment {
    fn end(&self) -> usize {
        self.base.as_usize() + self.frames * PAGE_SIZE
    }

    fn overlaps(&self, base: usize, end: usize) -> bool {
        base < self.end() && self.base.as_usize() < end
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base.as_usize() && addr < self.end()
    }
}

struct PendingSegments {
    segments: Vec<Segment>,
    sealed: bool,
}

struct FreeState {
    /// Per segment: frame index (local to the segment) to start searching at
    hints: Vec<usize>,
    free_frames: usize,
    outstanding_runs: usize,
    failed_allocations: u64,
}

struct FrameTable {
    /// Sorted by base address
    segments: Box<[Segment]>,
    pages: Box<[Page]>,
    free: Mutex<FreeState>,
}

impl FrameTable {
    fn build(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.base);

        let mut pages = Vec::with_capacity(segments.iter().map(|s| s.frames).sum());
        for segment in segments.iter_mut() {
            segment.first = pages.len();
            for i in 0..segment.frames {
                pages.push(Page::new(segment.base.add(i * PAGE_SIZE)));
            }
        }

        let total = pages.len();
        FrameTable {
            free: Mutex::new(FreeState {
                hints: segments.iter().map(|_| 0).collect(),
                free_frames: total,
                outstanding_runs: 0,
                failed_allocations: 0,
            }),
            segments: segments.into_boxed_slice(),
            pages: pages.into_boxed_slice(),
        }
    }

    /// First fit inside `segment`, starting at `hint`, wrapping around once
    fn find_run(&self, segment: &Segment, hint: usize, count: usize) -> Option<usize> {
        if count > segment.frames {
            return None;
        }

        let last_start = segment.frames - count;
        let hint = if hint > last_start { 0 } else { hint };
        let is_free = |local: usize| !self.pages[segment.first + local].is_allocated();

        let scan = |from: usize, to: usize| -> Option<usize> {
            let mut start = from;
            while start <= to {
                match (0..count).find(|i| !is_free(start + i)) {
                    None => return Some(start),
                    // skip past the allocated frame
                    Some(i) => start += i + 1,
                }
            }
            None
        };

        scan(hint, last_start).or_else(|| {
            if hint == 0 {
                None
            } else {
                scan(0, (hint - 1).min(last_start))
            }
        })
    }
}

/// Owner of all physical page frames
pub struct FrameAllocator {
    config: UvmConfig,
    memory: Box<dyn PhysMemoryModule>,
    pending: Mutex<PendingSegments>,
    table: Once<FrameTable>,
}

impl FrameAllocator {
    pub fn new(config: UvmConfig, memory: Box<dyn PhysMemoryModule>) -> Self {
        Self {
            config,
            memory,
            pending: Mutex::new(PendingSegments {
                segments: Vec::new(),
                sealed: false,
            }),
            table: Once::new(),
        }
    }

    /// Registers the physical range `[base, base + length)`.
    ///
    /// The range is shrunk to whole pages. Fails if it overlaps a registered
    /// segment or if the frame table was already built.
    pub fn add_segment(&self, base: PhysAddr, length: usize) -> Result<(), MmError> {
        let invalid = MmError::InvalidSegment {
            base: base.as_usize(),
            length,
        };

        let start = base.align_up().ok_or(invalid)?;
        let end = base
            .as_usize()
            .checked_add(length)
            .map(|end| PhysAddr::new(end).align_down())
            .ok_or(invalid)?;
        if end <= start {
            return Err(invalid);
        }

        let mut pending = self.pending.lock();
        if pending.sealed {
            return Err(MmError::AllocatorSealed);
        }

        if pending
            .segments
            .iter()
            .any(|s| s.overlaps(start.as_usize(), end.as_usize()))
        {
            return Err(MmError::SegmentOverlap {
                base: base.as_usize(),
                length,
            });
        }

        if pending.segments.len() >= self.config.max_segments {
            return Err(MmError::TooManySegments {
                max: self.config.max_segments,
            });
        }

        let frames = pages_in(end.as_usize() - start.as_usize());
        pending.segments.push(Segment {
            base: start,
            frames,
            first: 0,
        });

        debug!(
            "Registered segment {:#x}..{:#x} ({} frames)",
            start,
            end,
            frames
        );

        Ok(())
    }

    fn table(&self) -> &FrameTable {
        self.table.call_once(|| {
            let mut pending = self.pending.lock();
            pending.sealed = true;

            let table = FrameTable::build(core::mem::take(&mut pending.segments));
            debug!(
                "Frame table sealed: {} segment(s), {} frames",
                table.segments.len(),
                table.pages.len()
            );
            table
        })
    }

    /// Allocates a run of `count` contiguous frames and returns its head.
    ///
    /// Contiguity never spans segment borders.
    pub fn alloc(&self, count: usize, options: AllocOptions) -> Result<FrameNumber, MmError> {
        if count == 0 || count > self.config.max_run_frames {
            return Err(MmError::InvalidRunLength {
                requested: count,
                max: self.config.max_run_frames,
            });
        }

        let table = self.table();
        let head = {
            let mut free = table.free.lock();

            let found = if free.free_frames < count {
                None
            } else {
                table
                    .segments
                    .iter()
                    .enumerate()
                    .find_map(|(i, s)| table.find_run(s, free.hints[i], count).map(|l| (i, l)))
            };

            let Some((segment_index, local)) = found else {
                free.failed_allocations += 1;
                trace!("Allocation of {} frame(s) failed", count);
                return Err(MmError::OutOfFrames { requested: count });
            };

            let segment = &table.segments[segment_index];
            let head = segment.first + local;
            for index in head..head + count {
                let page = &table.pages[index];
                let keep = if options.zero {
                    PageFlags::empty()
                } else {
                    page.flags() & PageFlags::HW_MIRROR
                };

                let mut flags = keep | PageFlags::ALLOCATED;
                if index != head {
                    flags |= PageFlags::TAIL;
                }
                page.replace_flags(flags);
            }
            table.pages[head].set_run_len(count);

            free.hints[segment_index] = local + count;
            free.free_frames -= count;
            free.outstanding_runs += 1;
            head
        };

        if options.zero {
            // frames are exclusively ours now
            self.memory
                .zero(table.pages[head].paddr(), count * PAGE_SIZE);
        }

        trace!(
            "Allocated {} frame(s) at {:#x}",
            count,
            table.pages[head].paddr()
        );
        Ok(FrameNumber(head))
    }

    /// Returns a run to the free set.
    ///
    /// # Panics
    ///
    /// If `frame` is not the head of an allocated run or is still resident in
    /// an object. Both mean that the caller's bookkeeping is corrupt.
    pub fn free(&self, frame: FrameNumber) {
        let table = self.table();
        let Some(head) = table.pages.get(frame.0) else {
            error!("Freeing frame {} which does not exist", frame.0);
            panic!("free of unknown frame {}", frame.0);
        };

        let mut free = table.free.lock();

        let flags = head.flags();
        if !flags.contains(PageFlags::ALLOCATED) {
            error!("Double free of frame at {:#x}", head.paddr());
            panic!("double free of frame at {:#x}", head.paddr());
        }
        if flags.contains(PageFlags::TAIL) {
            error!("Freeing tail frame at {:#x}", head.paddr());
            panic!("frame at {:#x} is not the head of a run", head.paddr());
        }
        if let Some((id, offset)) = head.owner() {
            error!(
                "Freeing frame at {:#x} still resident in object {:?} at {:#x}",
                head.paddr(),
                id,
                offset
            );
            panic!("frame at {:#x} is still resident in an object", head.paddr());
        }
        if flags.contains(PageFlags::ANON) {
            error!("Freeing frame at {:#x} still owned by an anon cell", head.paddr());
            panic!("frame at {:#x} is still owned by an anon cell", head.paddr());
        }

        let count = head.run_len();
        if self.config.poison_freed_frames {
            self.memory
                .fill(head.paddr(), count * PAGE_SIZE, POISON_BYTE);
        }

        for page in table.pages[frame.0..frame.0 + count].iter() {
            page.replace_flags(page.flags() & PageFlags::HW_MIRROR);
        }
        head.set_run_len(0);

        // segments are sorted by base and therefore by first frame number
        let segment_index = table.segments.partition_point(|s| s.first <= frame.0) - 1;
        let local = frame.0 - table.segments[segment_index].first;
        if local < free.hints[segment_index] {
            free.hints[segment_index] = local;
        }

        free.free_frames += count;
        free.outstanding_runs -= 1;

        trace!("Freed {} frame(s) at {:#x}", count, head.paddr());
    }

    /// Maps a physical address to the frame containing it
    pub fn find(&self, paddr: PhysAddr) -> Option<FrameNumber> {
        let table = self.table();
        let addr = paddr.as_usize();

        // last segment starting at or below `addr`
        let index = table
            .segments
            .partition_point(|s| s.base.as_usize() <= addr)
            .checked_sub(1)?;
        let segment = &table.segments[index];
        if !segment.contains(addr) {
            return None;
        }

        Some(FrameNumber(
            segment.first + ((addr - segment.base.as_usize()) >> PAGE_SHIFT),
        ))
    }

    /// Descriptor of `frame`
    ///
    /// # Panics
    ///
    /// If `frame` was not produced by this allocator.
    pub fn page(&self, frame: FrameNumber) -> &Page {
        &self.table().pages[frame.0]
    }

    pub fn paddr(&self, frame: FrameNumber) -> PhysAddr {
        self.page(frame).paddr()
    }

    /// Direct access to frame contents
    pub fn memory(&self) -> &dyn PhysMemoryModule {
        self.memory.as_ref()
    }

    pub fn stats(&self) -> FrameStats {
        let table = self.table();
        let free = table.free.lock();
        FrameStats {
            total_frames: table.pages.len(),
            free_frames: free.free_frames,
            allocated_frames: table.pages.len() - free.free_frames,
            outstanding_runs: free.outstanding_runs,
            failed_allocations: free.failed_allocations,
        }
    }
}

#[cfg(test)]
mod test {
    use alloc::{boxed::Box, collections::BTreeSet, vec::Vec};

    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    use super::{AllocOptions, FrameAllocator};
    use crate::{
        error::MmError,
        modules::phys_memory::HeapPhysMemory,
        page::{FrameNumber, PageFlags, PhysAddr, PAGE_SIZE},
        test::get_test_frames,
        uvm_config::{UvmConfig, POISON_BYTE},
    };

    const SEGMENTS: [(usize, usize); 2] = [(0x10_0000, 8), (0x40_0000, 4)];

    fn test_frames() -> FrameAllocator {
        get_test_frames(&SEGMENTS, UvmConfig::default())
    }

    /// all frames of the run starting at `head`
    fn run_frames(frames: &FrameAllocator, head: FrameNumber) -> Vec<usize> {
        (head.index()..head.index() + frames.page(head).run_len()).collect()
    }

    #[test]
    fn test_add_segment_rejects_overlap() {
        let frames = FrameAllocator::new(
            UvmConfig::default(),
            Box::new(HeapPhysMemory::new(&[])),
        );
        frames
            .add_segment(PhysAddr::new(0x10_0000), 4 * PAGE_SIZE)
            .unwrap();

        assert_eq!(
            frames.add_segment(PhysAddr::new(0x10_3000), 4 * PAGE_SIZE),
            Err(MmError::SegmentOverlap {
                base: 0x10_3000,
                length: 4 * PAGE_SIZE
            })
        );

        // directly adjacent is fine
        frames
            .add_segment(PhysAddr::new(0x10_4000), PAGE_SIZE)
            .unwrap();
    }

    #[test]
    fn test_add_segment_rejects_tiny_ranges() {
        let frames = FrameAllocator::new(
            UvmConfig::default(),
            Box::new(HeapPhysMemory::new(&[])),
        );

        // unaligned base shrinks the range below a single page
        assert!(matches!(
            frames.add_segment(PhysAddr::new(0x10_0001), PAGE_SIZE),
            Err(MmError::InvalidSegment { .. })
        ));
        assert!(matches!(
            frames.add_segment(PhysAddr::new(0x10_0000), 0),
            Err(MmError::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_add_segment_limit() {
        let config = UvmConfig {
            max_segments: 1,
            ..Default::default()
        };
        let frames = FrameAllocator::new(config, Box::new(HeapPhysMemory::new(&[])));

        frames.add_segment(PhysAddr::new(0), PAGE_SIZE).unwrap();
        assert_eq!(
            frames.add_segment(PhysAddr::new(0x10_0000), PAGE_SIZE),
            Err(MmError::TooManySegments { max: 1 })
        );
    }

    #[test]
    fn test_add_segment_after_allocation() {
        let frames = test_frames();
        frames.alloc(1, AllocOptions::default()).unwrap();

        assert_eq!(
            frames.add_segment(PhysAddr::new(0x80_0000), PAGE_SIZE),
            Err(MmError::AllocatorSealed)
        );
    }

    #[test]
    fn test_find_maps_addresses_back() {
        let frames = test_frames();
        let head = frames.alloc(3, AllocOptions::default()).unwrap();
        let paddr = frames.paddr(head);

        assert_eq!(frames.find(paddr), Some(head));
        assert_eq!(frames.find(paddr.add(PAGE_SIZE + 5)).unwrap().index(), head.index() + 1);
        assert_eq!(frames.find(PhysAddr::new(0x40_0000 + 4 * PAGE_SIZE)), None);
        assert_eq!(frames.find(PhysAddr::new(0)), None);
        // hole between the two segments
        assert_eq!(frames.find(PhysAddr::new(0x20_0000)), None);
        assert_eq!(frames.find(PhysAddr::new(0x40_0000 - 1)), None);

        let second_segment = frames.find(PhysAddr::new(0x40_1000)).unwrap();
        assert_eq!(frames.paddr(second_segment), PhysAddr::new(0x40_1000));
    }

    #[test]
    fn test_runs_do_not_span_segments() {
        let frames = test_frames();

        let first = frames.alloc(6, AllocOptions::default()).unwrap();
        assert_eq!(frames.paddr(first), PhysAddr::new(0x10_0000));

        // two frames left in the first segment, four in the second
        let second = frames.alloc(3, AllocOptions::default()).unwrap();
        assert_eq!(frames.paddr(second), PhysAddr::new(0x40_0000));

        let third = frames.alloc(2, AllocOptions::default()).unwrap();
        assert_eq!(frames.paddr(third), PhysAddr::new(0x10_6000));

        assert_eq!(
            frames.alloc(2, AllocOptions::default()),
            Err(MmError::OutOfFrames { requested: 2 })
        );
        frames.alloc(1, AllocOptions::default()).unwrap();
    }

    #[test]
    fn test_exhaustion() {
        let frames = test_frames();
        let total = frames.stats().total_frames;
        assert_eq!(total, 12);

        let mut seen = BTreeSet::new();
        for _ in 0..total {
            let frame = frames.alloc(1, AllocOptions::default()).unwrap();
            assert!(seen.insert(frame), "frame handed out twice");
        }

        assert_eq!(
            frames.alloc(1, AllocOptions::default()),
            Err(MmError::OutOfFrames { requested: 1 })
        );
        let stats = frames.stats();
        assert_eq!(stats.free_frames, 0);
        assert_eq!(stats.failed_allocations, 1);
    }

    #[test]
    fn test_invalid_run_length() {
        let frames = test_frames();
        assert!(matches!(
            frames.alloc(0, AllocOptions::default()),
            Err(MmError::InvalidRunLength { .. })
        ));
        assert!(matches!(
            frames.alloc(2000, AllocOptions::default()),
            Err(MmError::InvalidRunLength { .. })
        ));
    }

    #[test]
    fn test_random_alloc_free_disjoint() {
        const SEED: u64 = 9_418_231_117_002_611;
        let frames = test_frames();
        let mut rand = SmallRng::seed_from_u64(SEED);

        let mut outstanding: Vec<FrameNumber> = Vec::new();
        let mut owned: BTreeSet<usize> = BTreeSet::new();

        for _ in 0..2000 {
            if !outstanding.is_empty() && rand.next_u32() % 3 == 0 {
                let index = rand.next_u32() as usize % outstanding.len();
                let head = outstanding.swap_remove(index);
                for frame in run_frames(&frames, head) {
                    assert!(owned.remove(&frame));
                }
                frames.free(head);
            } else {
                let count = 1 + rand.next_u32() as usize % 3;
                match frames.alloc(count, AllocOptions::default()) {
                    Ok(head) => {
                        assert_eq!(frames.page(head).run_len(), count);
                        for frame in run_frames(&frames, head) {
                            assert!(owned.insert(frame), "frame {} handed out twice", frame);
                        }
                        outstanding.push(head);
                    }
                    Err(MmError::OutOfFrames { .. }) => {
                        // only acceptable if no run of that size is left
                        assert!(frames.stats().free_frames < 12);
                    }
                    Err(err) => panic!("unexpected error {:?}", err),
                }
            }

            let stats = frames.stats();
            assert_eq!(stats.allocated_frames, owned.len());
            assert_eq!(stats.outstanding_runs, outstanding.len());
        }
    }

    #[test]
    fn test_hw_bits_survive_unless_zeroed() {
        let frames = get_test_frames(&[(0x10_0000, 1)], UvmConfig::default());

        let frame = frames.alloc(1, AllocOptions::default()).unwrap();
        frames
            .page(frame)
            .set_flags(PageFlags::REFERENCED | PageFlags::MODIFIED);
        frames.memory().fill(frames.paddr(frame), PAGE_SIZE, 0x77);
        frames.free(frame);

        let frame = frames.alloc(1, AllocOptions::default()).unwrap();
        assert_eq!(
            frames.page(frame).flags(),
            PageFlags::ALLOCATED | PageFlags::REFERENCED | PageFlags::MODIFIED
        );
        frames.free(frame);

        let frame = frames.alloc(1, AllocOptions::zeroed()).unwrap();
        assert_eq!(frames.page(frame).flags(), PageFlags::ALLOCATED);

        let mut buffer = [0xffu8; PAGE_SIZE];
        frames.memory().read(frames.paddr(frame), &mut buffer);
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_poison_on_free() {
        let config = UvmConfig {
            poison_freed_frames: true,
            ..Default::default()
        };
        let frames = get_test_frames(&[(0x10_0000, 2)], config);

        let frame = frames.alloc(2, AllocOptions::zeroed()).unwrap();
        let paddr = frames.paddr(frame);
        frames.free(frame);

        let mut buffer = [0u8; 8];
        frames.memory().read(paddr.add(PAGE_SIZE), &mut buffer);
        assert_eq!(buffer, [POISON_BYTE; 8]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let frames = test_frames();
        let frame = frames.alloc(1, AllocOptions::default()).unwrap();
        frames.free(frame);
        frames.free(frame);
    }

    #[test]
    #[should_panic(expected = "not the head of a run")]
    fn test_free_tail_panics() {
        let frames = test_frames();
        let head = frames.alloc(2, AllocOptions::default()).unwrap();
        frames.free(FrameNumber(head.index() + 1));
    }

    #[test]
    #[should_panic(expected = "still owned by an anon cell")]
    fn test_free_anon_page_panics() {
        let frames = test_frames();
        let frame = frames.alloc(1, AllocOptions::default()).unwrap();
        frames.page(frame).set_flags(PageFlags::ANON);
        frames.free(frame);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_free_never_allocated_panics() {
        let frames = test_frames();
        frames.free(FrameNumber(3));
    }
}
