// Physical memory layout
//
// qemu -machine virt loads the kernel at 0x80000000, and the page allocator
// hands out frames above it:
//
// 80000000 -- KERNBASE, first frame of the allocation area
// KERNBASE + NFRAMES * PGSIZE -- end of RAM used by the kernel

pub const KERNBASE: usize = 0x8000_0000;
