//! Sv39 geometry and the per-hart interrupt enable bit.
//!
//! On hardware the enable bit is `sstatus.SIE`; here every execution context carries its own
//! copy, and setting it takes any interrupts that arrived while it was clear.

pub mod interrupts {
    use core::cell::Cell;

    std::thread_local! {
        /// Supervisor Interrupt Enable for this hart. Harts come up interruptible.
        static SIE: Cell<bool> = const { Cell::new(true) };
    }

    /// Enables interrupts and takes any that are pending on this hart.
    #[inline]
    pub fn enable() {
        write(true);
        crate::trap::deliver_pending();
    }

    #[inline]
    pub fn disable() {
        write(false);
    }

    #[inline]
    pub fn get() -> bool {
        SIE.with(Cell::get)
    }

    /// Writes the enable bit without taking pending interrupts.
    #[inline]
    pub(crate) fn write(enabled: bool) {
        SIE.with(|sie| sie.set(enabled));
    }
}

// number of bits to offset within a page
pub const PGSHIFT: usize = 12;
// number of bytes per page
pub const PGSIZE: usize = 1 << PGSHIFT;

pub const fn pg_round_up(size: usize) -> usize {
    (size + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Valid bit
pub const PTE_V: usize = 1 << 0;
/// Readable bit
pub const PTE_R: usize = 1 << 1;
/// Writable bit
pub const PTE_W: usize = 1 << 2;
/// Executable bit
pub const PTE_X: usize = 1 << 3;
/// User bit (if not set, can only be used in supervisor mode)
pub const PTE_U: usize = 1 << 4;

pub const fn pa_to_pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

pub const fn pte_to_pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

pub const fn pte_flags(pte: usize) -> usize {
    pte & 0x3FF
}

/// number of page table levels
pub const LEVELS: usize = 3;
/// entries per page table
pub const NPTE: usize = 512;

pub const PXMASK: usize = 0x1FF; // 9 bits

// returns the amount to shift-left to get to the correct page table index
pub const fn px_shift(level: usize) -> usize {
    // 12-bit page offset + 9-bit per level
    PGSHIFT + (9 * level)
}

// returns the page table index of the va for the corresponding level
pub const fn px(level: usize, va: usize) -> usize {
    (va >> px_shift(level)) & PXMASK
}

// one beyond the highest possible virtual address
// MAXVA is actually one bit less than the max allowed by Sv39, to avoid having to sign-extend
// virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_fields() {
        let va = (3 << px_shift(2)) | (5 << px_shift(1)) | (7 << px_shift(0)) | 0x123;
        assert_eq!(px(2, va), 3);
        assert_eq!(px(1, va), 5);
        assert_eq!(px(0, va), 7);
        assert_eq!(va & (PGSIZE - 1), 0x123);
    }

    #[test]
    fn pte_conversion() {
        let pa = 0x8000_3000;
        let pte = pa_to_pte(pa) | PTE_V | PTE_R;
        assert_eq!(pte_to_pa(pte), pa);
        assert_eq!(pte_flags(pte), PTE_V | PTE_R);
        assert_eq!(pg_round_down(0x1fff), 0x1000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
    }

    #[test]
    fn interrupt_bit_is_per_hart() {
        interrupts::disable();
        assert!(!interrupts::get());

        std::thread::spawn(|| assert!(interrupts::get()))
            .join()
            .unwrap();

        interrupts::enable();
        assert!(interrupts::get());
    }
}
