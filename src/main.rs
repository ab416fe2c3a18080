use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use kernel::buf::{self, bcache};
use kernel::disk::{IntrDisk, RamDisk};
use kernel::error::KernelError;
use kernel::kalloc::{self, kmem};
use kernel::param::{FSSIZE, NBUF, NFRAMES, ROOTDEV};
use kernel::printf;
use kernel::proc::{self, Channel};
use kernel::riscv::{PGSIZE, PTE_R, PTE_W};
use kernel::spinlock::SpinLock;
use kernel::vm::{PA, PageTable, VA};

const NHART: usize = 4;

static STARTED: AtomicBool = AtomicBool::new(false);
static STARTED_LOCK: SpinLock<()> = SpinLock::new((), "started");

/// Work done by every hart once the kernel is up: stamp its own disk block through the buffer
/// cache, then map it at a virtual address and read it back through a page table.
fn hart_main(hart: usize) -> Result<(), KernelError> {
    let block_no = hart as u32 + 1;

    let mut b = bcache().read(ROOTDEV, block_no)?;
    b.data_mut()[..8].copy_from_slice(&(hart as u64).to_le_bytes());
    let written = bcache().write(&mut b);
    bcache().release(b);
    written?;

    let mut pagetable = PageTable::new(kmem())?;
    let frame = kmem().alloc()?;
    let va = VA(0x4000_0000 + hart * PGSIZE);
    pagetable.map_pages(va, frame, PGSIZE, PTE_R | PTE_W)?;

    let b = bcache().read(ROOTDEV, block_no)?;
    // Safety: the frame was just allocated and is only reachable through this page table
    let page = unsafe { kmem().frame_mut(frame) };
    page[..8].copy_from_slice(&b.data()[..8]);
    bcache().release(b);

    let pa = pagetable.resolve(VA(va.0 + 3)).ok_or(KernelError::InvalidArgument)?;
    log::info!("va {:#x} -> pa {:#x}", va.0 + 3, pa.0);
    assert_eq!(pa, PA(frame.0 + 3), "hart {hart}: bad translation");

    pagetable.unmap(va, 1, true);
    pagetable.free();
    Ok(())
}

fn boot() -> Result<(), KernelError> {
    printf::init();
    log::info!("");
    log::info!("kcore is booting");
    log::info!("");

    kalloc::init(NFRAMES)?;
    buf::init(NBUF, IntrDisk::new(RamDisk::new(ROOTDEV, FSSIZE)))?;

    let harts = (0..NHART)
        .map(|hart| {
            proc::spawn(&format!("hart{hart}"), move || {
                let mut started = STARTED_LOCK.lock();
                while !STARTED.load(Ordering::Acquire) {
                    started = proc::sleep(Channel::Addr(&STARTED as *const _ as usize), started);
                }
                drop(started);

                log::info!("hart {hart} is starting");
                hart_main(hart)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    {
        let _started = STARTED_LOCK.lock();
        STARTED.store(true, Ordering::Release);
        proc::wakeup(Channel::Addr(&STARTED as *const _ as usize));
    }

    for hart in harts {
        hart.join()?;
    }

    log::info!("{:?}", bcache().stats());
    log::info!("kmem free {} frames", kmem().free_frames());
    Ok(())
}

fn main() -> ExitCode {
    match boot() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("boot failed: {e}");
            ExitCode::FAILURE
        }
    }
}
