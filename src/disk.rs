//! Block devices behind the buffer cache.
//!
//! `RamDisk` answers requests synchronously from memory. `IntrDisk` puts a device in front of any
//! other `BlockDevice`: requests are queued for a device thread, and the caller sleeps until the
//! device's completion interrupt wakes it, the way the virtio driver waits for its used ring.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::DiskError;
use crate::param::BSIZE;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;
use crate::trap;

pub type Block = [u8; BSIZE];

/// Storage addressed by device number and block number.
pub trait BlockDevice: Send + Sync {
    fn read(&self, dev: u32, block_no: u32, data: &mut Block) -> Result<(), DiskError>;
    fn write(&self, dev: u32, block_no: u32, data: &Block) -> Result<(), DiskError>;
}

/// A disk held in memory.
#[derive(Debug)]
pub struct RamDisk {
    dev: u32,
    blocks: SpinLock<Vec<Block>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    /// A zero-filled disk of `nblocks` blocks answering to device number `dev`.
    pub fn new(dev: u32, nblocks: usize) -> Self {
        Self {
            dev,
            blocks: SpinLock::new(vec![[0; BSIZE]; nblocks], "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of block reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Copy of a block as currently stored, bypassing the request counters.
    pub fn block(&self, block_no: u32) -> Option<Block> {
        self.blocks.lock().get(block_no as usize).copied()
    }

    fn check(&self, dev: u32) -> Result<(), DiskError> {
        if dev != self.dev {
            return Err(DiskError::NoDevice(dev));
        }
        Ok(())
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, dev: u32, block_no: u32, data: &mut Block) -> Result<(), DiskError> {
        self.check(dev)?;
        let blocks = self.blocks.lock();
        let block = blocks
            .get(block_no as usize)
            .ok_or(DiskError::OutOfRange(block_no))?;

        data.copy_from_slice(block);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, dev: u32, block_no: u32, data: &Block) -> Result<(), DiskError> {
        self.check(dev)?;
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(block_no as usize)
            .ok_or(DiskError::OutOfRange(block_no))?;

        block.copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read(&self, dev: u32, block_no: u32, data: &mut Block) -> Result<(), DiskError> {
        (**self).read(dev, block_no, data)
    }

    fn write(&self, dev: u32, block_no: u32, data: &Block) -> Result<(), DiskError> {
        (**self).write(dev, block_no, data)
    }
}

/// One queued transfer.
struct Request {
    id: usize,
    dev: u32,
    block_no: u32,
    write: bool,
    data: Box<Block>,
}

/// Result of a finished transfer, waiting for its requester.
struct Completion {
    data: Box<Block>,
    status: Result<(), DiskError>,
}

/// Driver state, protected by the disk lock.
#[derive(Default)]
struct DiskQueue {
    next_id: usize,
    requests: VecDeque<Request>,
    done: BTreeMap<usize, Completion>,
    shutdown: bool,
}

struct Shared {
    backing: Box<dyn BlockDevice>,
    queue: SpinLock<DiskQueue>,
    interrupts: AtomicUsize,
}

/// An interrupt-driven disk.
pub struct IntrDisk {
    shared: Arc<Shared>,
    device: Option<JoinHandle<()>>,
}

impl IntrDisk {
    /// Starts the device thread serving requests from `backing`.
    pub fn new(backing: impl BlockDevice + 'static) -> Self {
        let shared = Arc::new(Shared {
            backing: Box::new(backing),
            queue: SpinLock::new(DiskQueue::default(), "disk"),
            interrupts: AtomicUsize::new(0),
        });

        let device_shared = shared.clone();
        let device = thread::Builder::new()
            .name("disk".into())
            .spawn(move || device_loop(device_shared))
            .expect("disk: device thread");

        Self {
            shared,
            device: Some(device),
        }
    }

    /// Number of completion interrupts the device has raised.
    pub fn interrupts(&self) -> usize {
        self.shared.interrupts.load(Ordering::Relaxed)
    }

    fn notify(&self) {
        if let Some(device) = &self.device {
            device.thread().unpark();
        }
    }

    /// Queues a transfer and sleeps until the device completes it.
    fn rw(&self, dev: u32, block_no: u32, data: &mut Block, write: bool) -> Result<(), DiskError> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(DiskError::Offline);
        }

        let id = queue.next_id;
        queue.next_id += 1;
        queue.requests.push_back(Request {
            id,
            dev,
            block_no,
            write,
            data: Box::new(*data),
        });

        // tell the device
        self.notify();

        // wait for the interrupt handler to say the request has finished
        let completion = loop {
            if let Some(completion) = queue.done.remove(&id) {
                break completion;
            }
            queue = proc::sleep(Channel::Disk(id), queue);
        };
        drop(queue);

        if !write && completion.status.is_ok() {
            data.copy_from_slice(&*completion.data);
        }
        completion.status
    }
}

impl BlockDevice for IntrDisk {
    fn read(&self, dev: u32, block_no: u32, data: &mut Block) -> Result<(), DiskError> {
        self.rw(dev, block_no, data, false)
    }

    fn write(&self, dev: u32, block_no: u32, data: &Block) -> Result<(), DiskError> {
        let mut copy = *data;
        self.rw(dev, block_no, &mut copy, true)
    }
}

impl IntrDisk {
    /// Stops the device once its queue drains.
    /// Returns false if the device thread died by panicking.
    fn stop(&mut self) -> bool {
        self.shared.queue.lock().shutdown = true;
        self.notify();

        match self.device.take() {
            Some(device) => device.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for IntrDisk {
    fn drop(&mut self) {
        if !self.stop() {
            log::error!("disk: device thread panicked");
        }
    }
}

/// The device: performs queued transfers and raises an interrupt for each one.
fn device_loop(shared: Arc<Shared>) {
    loop {
        let request = {
            let mut queue = shared.queue.lock();
            if queue.shutdown && queue.requests.is_empty() {
                break;
            }
            queue.requests.pop_front()
        };

        let Some(mut request) = request else {
            // an unpark that raced with the check above is remembered by the token
            thread::park();
            continue;
        };

        let status = if request.write {
            shared.backing.write(request.dev, request.block_no, &request.data)
        } else {
            shared
                .backing
                .read(request.dev, request.block_no, &mut request.data)
        };

        let handler_shared = shared.clone();
        trap::interrupt(move || intr(&handler_shared, request, status));
    }
}

/// Completion interrupt handler.
fn intr(shared: &Shared, request: Request, status: Result<(), DiskError>) {
    shared.interrupts.fetch_add(1, Ordering::Relaxed);

    let mut queue = shared.queue.lock();
    queue.done.insert(
        request.id,
        Completion {
            data: request.data,
            status,
        },
    );

    proc::wakeup(Channel::Disk(request.id));
}
