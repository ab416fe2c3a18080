use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::ptr::NonNull;

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::error::KernelError;
use crate::memlayout::KERNBASE;
use crate::riscv::PGSIZE;
use crate::spinlock::SpinLock;
use crate::sync::OnceLock;
use crate::vm::PA;

/// Kernel page allocator
pub static KMEM: OnceLock<Kmem> = OnceLock::new();

/// Physical memory handed out one page at a time.
///
/// Frame `n` of the region is physical address `KERNBASE + n * PGSIZE`.
pub struct Kmem {
    base: NonNull<u8>,
    layout: Layout,
    alloc: SpinLock<KmemInner>,
}

struct KmemInner {
    buddy: BuddyAlloc,
    /// Frames the allocator can still hand out.
    free: usize,
}

/// # Safety
/// Even though `BuddyAlloc` is not thread safe, `Kmem` is thread safe because it is guarded by a
/// `SpinLock`. The region behind `base` is owned by `Kmem` and only reached through its methods.
unsafe impl Sync for Kmem {}
unsafe impl Send for Kmem {}

impl Kmem {
    /// Creates an allocator over `nframes` pages of fresh memory.
    pub fn new(nframes: usize) -> Result<Self, KernelError> {
        if nframes == 0 {
            err!(KernelError::InvalidArgument);
        }

        let Some(size) = nframes.checked_mul(PGSIZE) else {
            err!(KernelError::InvalidArgument);
        };
        let Ok(layout) = Layout::from_size_align(size, PGSIZE) else {
            err!(KernelError::InvalidArgument);
        };

        // Safety: layout has a non-zero size
        let Some(base) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            err!(KernelError::Alloc);
        };

        let alloc_param = BuddyAllocParam::new(base.as_ptr(), size, PGSIZE);
        // Safety: the region is ours, zeroed and page aligned
        let mut buddy = unsafe { BuddyAlloc::new(alloc_param) };

        // the allocator keeps its bookkeeping inside the region, so count what is really left
        let mut frames = Vec::with_capacity(nframes);
        loop {
            let ptr = buddy.malloc(PGSIZE);
            if ptr.is_null() {
                break;
            }
            frames.push(ptr);
        }
        let free = frames.len();
        for ptr in frames {
            buddy.free(ptr);
        }

        Ok(Self {
            base,
            layout,
            alloc: SpinLock::new(KmemInner { buddy, free }, "kmem"),
        })
    }

    /// Number of frames in the region, including the allocator's own bookkeeping.
    pub fn nframes(&self) -> usize {
        self.layout.size() / PGSIZE
    }

    /// Number of frames `alloc()` can still hand out.
    pub fn free_frames(&self) -> usize {
        self.alloc.lock().free
    }

    /// Allocates one zeroed page of physical memory.
    pub fn alloc(&self) -> Result<PA, KernelError> {
        let ptr = {
            let mut inner = self.alloc.lock();
            let ptr = inner.buddy.malloc(PGSIZE);
            if !ptr.is_null() {
                inner.free -= 1;
            }
            ptr
        };
        if ptr.is_null() {
            err!(KernelError::Alloc);
        }

        let offset = ptr as usize - self.base.as_ptr() as usize;
        assert_eq!(offset % PGSIZE, 0, "kalloc: misaligned frame");

        let pa = PA(KERNBASE + offset);
        // Safety: the frame was just handed out and nobody else refers to it
        unsafe { self.frame_mut(pa) }.fill(0);
        Ok(pa)
    }

    /// Frees the page of physical memory at `pa`, which must have come from `alloc()`.
    pub fn free(&self, pa: PA) {
        // fill with junk to catch dangling refs
        // Safety: the caller gives the frame back, so nobody else refers to it
        unsafe { self.frame_mut(pa) }.fill(1);

        let ptr = self.frame_ptr(pa);
        let mut inner = self.alloc.lock();
        inner.buddy.free(ptr);
        inner.free += 1;
    }

    fn frame_ptr(&self, pa: PA) -> *mut u8 {
        assert!(
            pa.0 % PGSIZE == 0 && pa.0 >= KERNBASE && pa.0 - KERNBASE < self.layout.size(),
            "kmem: bad frame {:#x}",
            pa.0
        );

        // Safety: the offset is inside the region
        unsafe { self.base.as_ptr().add(pa.0 - KERNBASE) }
    }

    /// Returns the page at `pa`.
    ///
    /// # Safety
    /// No mutable reference to the same frame may be alive.
    pub unsafe fn frame(&self, pa: PA) -> &[u8; PGSIZE] {
        unsafe { &*(self.frame_ptr(pa) as *const [u8; PGSIZE]) }
    }

    /// Returns the page at `pa` for writing.
    ///
    /// # Safety
    /// The caller must own the frame, and no other reference to it may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, pa: PA) -> &mut [u8; PGSIZE] {
        unsafe { &mut *(self.frame_ptr(pa) as *mut [u8; PGSIZE]) }
    }
}

impl core::fmt::Debug for Kmem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kmem")
            .field("nframes", &self.nframes())
            .field("free", &self.free_frames())
            .finish_non_exhaustive()
    }
}

impl Drop for Kmem {
    fn drop(&mut self) {
        // Safety: allocated in `new()` with the same layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Initialize kernel memory allocator.
///
/// Must be called only once; a second call panics.
pub fn init(nframes: usize) -> Result<(), KernelError> {
    let first = KMEM.initialize(|| Kmem::new(nframes))?;
    assert!(first, "kmem init twice");

    log::info!("kmem top  {:#X}", KERNBASE + nframes * PGSIZE);
    log::info!("kmem base {:#X}", KERNBASE);
    log::info!("kmem free {} frames", kmem().free_frames());

    Ok(())
}

/// Returns the kernel page allocator.
pub fn kmem() -> &'static Kmem {
    KMEM.get().expect("kmem to be init")
}
