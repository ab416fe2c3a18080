use std::sync::Arc;

use kernel::buf::{self, BCache, EvictPolicy, bcache};
use kernel::disk::{BlockDevice, IntrDisk, RamDisk};
use kernel::kalloc::{self, kmem};
use kernel::param::{BSIZE, ROOTDEV};
use kernel::proc;
use kernel::riscv::{PGSIZE, PTE_R};
use kernel::vm::{PageTable, VA};

#[test]
fn concurrent_increments_over_interrupt_disk() {
    let ram = Arc::new(RamDisk::new(ROOTDEV, 32));
    let cache = BCache::with_policy(4, IntrDisk::new(ram.clone()), EvictPolicy::Lru).unwrap();
    let cache = Arc::new(cache);

    const WORKERS: usize = 4;
    const ROUNDS: usize = 50;

    let workers: Vec<_> = (0..WORKERS)
        .map(|n| {
            let cache = cache.clone();
            proc::spawn(&format!("worker{n}"), move || {
                for round in 0..ROUNDS {
                    // a shared counter block, plus a private block that keeps the cache churning
                    let mut b = cache.read(ROOTDEV, 0).unwrap();
                    let count = u32::from_le_bytes(b.data()[..4].try_into().unwrap());
                    b.data_mut()[..4].copy_from_slice(&(count + 1).to_le_bytes());
                    cache.write(&mut b).unwrap();
                    cache.release(b);

                    let block_no = 1 + (n * ROUNDS + round) as u32 % 31;
                    let b = cache.read(ROOTDEV, block_no).unwrap();
                    cache.release(b);
                }
            })
            .unwrap()
        })
        .collect();

    for worker in workers {
        worker.join();
    }

    let counter = ram.block(0).unwrap();
    assert_eq!(
        u32::from_le_bytes(counter[..4].try_into().unwrap()),
        (WORKERS * ROUNDS) as u32
    );

    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, (2 * WORKERS * ROUNDS) as u64);
    assert!(stats.evictions > 0);
}

#[test]
fn kernel_globals_initialize_once() {
    let ram = Arc::new(RamDisk::new(ROOTDEV, 8));
    let mut block = [0u8; BSIZE];
    block[0] = 0x99;
    ram.write(ROOTDEV, 2, &block).unwrap();

    kalloc::init(64).unwrap();
    buf::init(2, ram.clone()).unwrap();

    assert_eq!(bcache().capacity(), 2);

    let before = kmem().free_frames();
    let mut pagetable = PageTable::new(kmem()).unwrap();
    let frame = kmem().alloc().unwrap();
    pagetable.map_pages(VA(0x1000), frame, PGSIZE, PTE_R).unwrap();
    assert_eq!(pagetable.resolve(VA(0x1ABC)).map(|pa| pa.0), Some(frame.0 + 0xABC));
    assert!(kmem().free_frames() < before);

    // copy the cached block into the mapped page
    let b = bcache().read(ROOTDEV, 2).unwrap();
    let page = unsafe { kmem().frame_mut(frame) };
    page[..BSIZE].copy_from_slice(b.data());
    bcache().release(b);
    assert_eq!(unsafe { kmem().frame(frame) }[0], 0x99);

    pagetable.unmap(VA(0x1000), 1, true);
    pagetable.free();
    assert_eq!(kmem().free_frames(), before);

    let second = std::panic::catch_unwind(|| buf::init(2, RamDisk::new(ROOTDEV, 1)));
    assert!(second.is_err());
}
