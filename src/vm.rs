use core::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::error::VmError;
use crate::kalloc::Kmem;
use crate::riscv::{
    LEVELS, MAXVA, NPTE, PGSIZE, PTE_R, PTE_V, PTE_W, PTE_X, pa_to_pte, pg_round_down, pte_flags,
    pte_to_pa, px,
};

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PA(pub usize);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VA(pub usize);

impl VA {
    pub const fn page_offset(&self) -> usize {
        self.0 & (PGSIZE - 1)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PageTableEntry(usize);

impl PageTableEntry {
    pub const fn new(pa: PA, perm: usize) -> Self {
        Self(pa_to_pte(pa.0) | perm)
    }

    pub fn is_v(&self) -> bool {
        self.0 & PTE_V != 0
    }

    /// A valid entry with any of R/W/X maps a page; one with none points to the next level.
    pub fn is_leaf(&self) -> bool {
        self.0 & (PTE_R | PTE_W | PTE_X) != 0
    }

    pub fn flags(&self) -> usize {
        pte_flags(self.0)
    }

    pub fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

/// One level of the tree, viewed in place over its physical frame.
type RawPageTable = [PageTableEntry; NPTE];

/// Location of one entry: the frame of the table holding it and its index there.
///
/// Only `walk()` and `lookup()` make slots, and a slot is only accepted by the page table that
/// made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteSlot {
    owner: usize,
    table: PA,
    index: usize,
}

impl PteSlot {
    /// Frame of the level-0 table holding the entry.
    pub fn table(&self) -> PA {
        self.table
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// An Sv39 page table whose levels live in frames from `kmem`.
///
/// The table owns every level frame reachable from `root`; the leaf frames it maps belong to
/// whoever mapped them.
#[derive(Debug)]
pub struct PageTable<'a> {
    id: usize,
    kmem: &'a Kmem,
    root: PA,
}

impl<'a> PageTable<'a> {
    /// Creates an empty page table.
    pub fn new(kmem: &'a Kmem) -> Result<Self, VmError> {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

        let root = kmem.alloc().map_err(|_| VmError::Alloc)?;
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kmem,
            root,
        })
    }

    fn slot(&self, table: PA, va: VA) -> PteSlot {
        PteSlot {
            owner: self.id,
            table,
            index: px(0, va.0),
        }
    }

    fn check(&self, slot: PteSlot) {
        assert_eq!(slot.owner, self.id, "pte slot from another page table");
    }

    pub fn root(&self) -> PA {
        self.root
    }

    fn table(&self, pa: PA) -> &RawPageTable {
        // Safety: level frames reachable from `root` belong to this table, and `&self` excludes
        // writers
        bytemuck::from_bytes(unsafe { self.kmem.frame(pa) })
    }

    fn table_mut(&mut self, pa: PA) -> &mut RawPageTable {
        // Safety: level frames reachable from `root` belong to this table, and `&mut self` is
        // exclusive
        bytemuck::from_bytes_mut(unsafe { self.kmem.frame_mut(pa) })
    }

    /// Finds the leaf slot for `va` without allocating.
    pub fn lookup(&self, va: VA) -> Result<PteSlot, VmError> {
        if va.0 >= MAXVA {
            return Err(VmError::InvalidAddress);
        }

        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let pte = self.table(table)[px(level, va.0)];
            if !pte.is_v() {
                return Err(VmError::Unmapped);
            }
            assert!(!pte.is_leaf(), "walk: leaf at level {level}");
            table = pte.as_pa();
        }

        Ok(self.slot(table, va))
    }

    /// Returns the slot of the leaf entry in this page table that corresponds to `va`.
    /// If `alloc` is true, creates any required page-table levels.
    ///
    /// The Sv39 scheme has three levels of page-table pages. A page-table page contains 512
    /// 64-bit PTEs. A 64-bit virtual address is split into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    pub fn walk(&mut self, va: VA, alloc: bool) -> Result<PteSlot, VmError> {
        if !alloc {
            return self.lookup(va);
        }

        if va.0 >= MAXVA {
            err!(VmError::InvalidAddress);
        }

        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let index = px(level, va.0);
            let pte = self.table(table)[index];

            if pte.is_v() {
                assert!(!pte.is_leaf(), "walk: leaf at level {level}");
                table = pte.as_pa();
            } else {
                let Ok(next) = self.kmem.alloc() else {
                    err!(VmError::Alloc);
                };
                self.table_mut(table)[index] = PageTableEntry::new(next, PTE_V);
                table = next;
            }
        }

        Ok(self.slot(table, va))
    }

    pub fn entry(&self, slot: PteSlot) -> PageTableEntry {
        self.check(slot);
        self.table(slot.table)[slot.index]
    }

    pub fn set_entry(&mut self, slot: PteSlot, pte: PageTableEntry) {
        self.check(slot);
        self.table_mut(slot.table)[slot.index] = pte;
    }

    /// Looks up a virtual address, returns the physical address it maps to, or `None` if not
    /// mapped.
    pub fn resolve(&self, va: VA) -> Option<PA> {
        let pte = self.entry(self.lookup(va).ok()?);
        if !pte.is_v() {
            return None;
        }

        Some(PA(pte.as_pa().0 + va.page_offset()))
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to physical addresses
    /// starting at `pa`. `va` and `size` might not be page-aligned.
    ///
    /// On error, the pages mapped before the failing one stay mapped.
    pub fn map_pages(&mut self, va: VA, pa: PA, size: usize, perm: usize) -> Result<(), VmError> {
        assert_ne!(size, 0, "map_pages: size");

        let Some(end) = va.0.checked_add(size - 1) else {
            err!(VmError::InvalidAddress);
        };
        let last = pg_round_down(end);
        let mut va = VA(pg_round_down(va.0));
        let mut pa = pa.0;

        loop {
            let slot = try_log!(self.walk(va, true));
            assert!(!self.entry(slot).is_v(), "map_pages: remap");

            self.set_entry(slot, PageTableEntry::new(PA(pa), perm | PTE_V));

            if va.0 == last {
                break;
            }

            va.0 += PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Removes `npages` of mappings starting from `va`, which must be page-aligned.
    /// The mappings must exist. Optionally frees the physical memory.
    pub fn unmap(&mut self, va: VA, npages: usize, do_free: bool) {
        assert_eq!(va.page_offset(), 0, "unmap: not aligned");

        for page in 0..npages {
            let a = VA(va.0 + page * PGSIZE);
            let slot = self.lookup(a).expect("unmap: walk");
            let pte = self.entry(slot);

            assert!(pte.is_v(), "unmap: not mapped");
            assert!(pte.is_leaf(), "unmap: not a leaf");

            if do_free {
                self.kmem.free(pte.as_pa());
            }
            self.set_entry(slot, PageTableEntry::default());
        }
    }

    /// Frees the page-table pages. All leaf mappings must already have been removed.
    pub fn free(self) {
        self.free_walk(self.root);
    }

    fn free_walk(&self, table: PA) {
        // there are 2^9 = 512 PTEs in a page table.
        for pte in self.table(table).iter().copied() {
            if pte.is_v() {
                assert!(!pte.is_leaf(), "freewalk: leaf");
                self.free_walk(pte.as_pa());
            }
        }

        self.kmem.free(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::KERNBASE;
    use crate::riscv::PTE_U;

    const PAGE: usize = 0x4000_2000;

    #[test]
    fn empty_table_has_no_translation() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        assert_eq!(pt.walk(VA(PAGE), false), Err(VmError::Unmapped));
        assert_eq!(pt.resolve(VA(PAGE)), None);
    }

    #[test]
    fn allocated_leaf_resolves_with_offset() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();
        let frame = PA(0x8765_4000);

        let slot = pt.walk(VA(PAGE), true).unwrap();
        assert!(!pt.entry(slot).is_v());
        assert_eq!(pt.resolve(VA(PAGE)), None, "leaf exists but is not valid");

        pt.set_entry(slot, PageTableEntry::new(frame, PTE_R | PTE_W | PTE_V));
        assert_eq!(pt.walk(VA(PAGE + 0x10), false), Ok(slot));

        for offset in [0, 0x123, PGSIZE - 1] {
            assert_eq!(pt.resolve(VA(PAGE + offset)), Some(PA(frame.0 + offset)));
        }
        assert_eq!(pt.resolve(VA(PAGE + PGSIZE)), None);
    }

    #[test]
    fn walk_allocates_only_missing_levels() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        let before = kmem.free_frames();
        let a = pt.walk(VA(PAGE), true).unwrap();
        assert_eq!(kmem.free_frames(), before - 2);

        // same level-0 table, next entry
        let b = pt.walk(VA(PAGE + PGSIZE), true).unwrap();
        assert_eq!(kmem.free_frames(), before - 2);
        assert_eq!(a.table(), b.table());
        assert_eq!(b.index(), a.index() + 1);
    }

    #[test]
    fn out_of_range_address_fails() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        assert_eq!(pt.walk(VA(MAXVA), true), Err(VmError::InvalidAddress));
        assert_eq!(pt.walk(VA(usize::MAX), false), Err(VmError::InvalidAddress));
        assert_eq!(pt.resolve(VA(MAXVA + 0x10)), None);
    }

    #[test]
    fn level_allocation_failure_is_recoverable() {
        let kmem = Kmem::new(16).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        let mut hoard = alloc::vec::Vec::new();
        while let Ok(pa) = kmem.alloc() {
            hoard.push(pa);
        }

        assert_eq!(pt.walk(VA(PAGE), true), Err(VmError::Alloc));
        assert_eq!(pt.resolve(VA(PAGE)), None);

        kmem.free(hoard.pop().unwrap());
        kmem.free(hoard.pop().unwrap());
        assert!(pt.walk(VA(PAGE), true).is_ok());
    }

    #[test]
    fn map_unmap_free_returns_every_frame() {
        let kmem = Kmem::new(64).unwrap();
        let before = kmem.free_frames();

        let mut pt = PageTable::new(&kmem).unwrap();
        let data = [kmem.alloc().unwrap(), kmem.alloc().unwrap()];

        pt.map_pages(VA(PAGE), data[0], PGSIZE, PTE_R | PTE_U).unwrap();
        pt.map_pages(VA(PAGE + PGSIZE), data[1], PGSIZE, PTE_R | PTE_W | PTE_U)
            .unwrap();
        assert_eq!(pt.resolve(VA(PAGE + PGSIZE + 8)), Some(PA(data[1].0 + 8)));
        // root, two data frames, one level-1 and one level-0 table
        assert_eq!(kmem.free_frames(), before - 5);

        let slot = pt.lookup(VA(PAGE)).unwrap();
        assert_eq!(pt.entry(slot).flags(), PTE_R | PTE_U | PTE_V);

        pt.unmap(VA(PAGE), 2, true);
        assert_eq!(pt.resolve(VA(PAGE)), None);
        assert_eq!(kmem.free_frames(), before - 3);

        pt.free();
        assert_eq!(kmem.free_frames(), before);
    }

    #[test]
    #[should_panic(expected = "pte slot from another page table")]
    fn slot_from_other_table_is_rejected() {
        let kmem = Kmem::new(32).unwrap();
        let mut a = PageTable::new(&kmem).unwrap();
        let mut b = PageTable::new(&kmem).unwrap();

        let slot = b.walk(VA(PAGE), true).unwrap();
        a.set_entry(slot, PageTableEntry::new(PA(KERNBASE), PTE_R | PTE_V));
    }

    #[test]
    fn map_range_past_address_space_fails() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();
        let before = kmem.free_frames();

        assert_eq!(
            pt.map_pages(VA(PAGE), PA(KERNBASE), usize::MAX - PAGE + 2, PTE_R),
            Err(VmError::InvalidAddress)
        );
        assert_eq!(pt.resolve(VA(PAGE)), None);
        assert_eq!(kmem.free_frames(), before);

        // the pages below MAXVA get mapped before the walk runs out of address space
        let va = VA(MAXVA - PGSIZE);
        assert_eq!(
            pt.map_pages(va, PA(KERNBASE), 2 * PGSIZE, PTE_R),
            Err(VmError::InvalidAddress)
        );
        assert_eq!(pt.resolve(va), Some(PA(KERNBASE)));
    }

    #[test]
    fn map_range_spans_pages() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        // 0x10 bytes before a boundary through 0x10 bytes after it: two pages
        pt.map_pages(VA(PAGE + PGSIZE - 0x10), PA(KERNBASE), 0x20, PTE_R)
            .unwrap();
        assert_eq!(pt.resolve(VA(PAGE)), Some(PA(KERNBASE)));
        assert_eq!(pt.resolve(VA(PAGE + PGSIZE)), Some(PA(KERNBASE + PGSIZE)));
        assert_eq!(pt.resolve(VA(PAGE + 2 * PGSIZE)), None);

        pt.unmap(VA(PAGE), 2, false);
        pt.free();
    }

    #[test]
    #[should_panic(expected = "map_pages: remap")]
    fn remap_is_fatal() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        pt.map_pages(VA(PAGE), PA(KERNBASE), PGSIZE, PTE_R).unwrap();
        let _ = pt.map_pages(VA(PAGE), PA(KERNBASE + PGSIZE), PGSIZE, PTE_R);
    }

    #[test]
    #[should_panic(expected = "freewalk: leaf")]
    fn free_with_live_mappings_is_fatal() {
        let kmem = Kmem::new(32).unwrap();
        let mut pt = PageTable::new(&kmem).unwrap();

        pt.map_pages(VA(PAGE), PA(KERNBASE), PGSIZE, PTE_R).unwrap();
        pt.free();
    }
}
