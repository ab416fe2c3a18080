use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::disk::{Block, BlockDevice};
use crate::error::KernelError;
use crate::param::BSIZE;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;
use crate::sync::OnceLock;

/// Buffer metadata, protected by `BCache`'s `SpinLock`.
#[derive(Debug, Clone, Default)]
pub struct BufMeta {
    /// `(dev, block_no)` the slot is bound to. Never-used slots match nothing.
    pub key: Option<(u32, u32)>,
    pub valid: bool,
    /// Dirty state as of the last release.
    pub dirty: bool,
    pub ref_count: u32,
    /// Set when the slot is bound to a new block and the content has not been reset yet.
    rebound: bool,
}

// LRU linked list using indices
#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

/// Buffer data, protected by `SleepLock` during I/O
#[derive(Debug, Clone)]
pub struct BufData {
    pub data: Block,
    dirty: bool,
}

impl BufData {
    const fn new() -> Self {
        Self {
            data: [0; BSIZE],
            dirty: false,
        }
    }
}

/// Names a cache slot independently of the content lock, for `pin()` and `unpin()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(usize);

/// A buffer handle returned by `get()`/`read()`.
/// Holds the `SleepLock` guard for the buffer data.
#[derive(Debug)]
pub struct Buf<'a> {
    id: usize,
    dev: u32,
    block_no: u32,
    guard: SleepLockGuard<'a, BufData>,
}

impl Buf<'_> {
    pub fn id(&self) -> BufId {
        BufId(self.id)
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn block(&self) -> u32 {
        self.block_no
    }

    pub fn data(&self) -> &Block {
        &self.guard.data
    }

    /// Content for writing. The buffer counts as dirty until the next `write()`.
    pub fn data_mut(&mut self) -> &mut Block {
        self.guard.dirty = true;
        &mut self.guard.data
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }
}

/// Which unreferenced buffer `get()` recycles on a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least recently used among clean buffers, falling back to `Lru`.
    PreferClean,
}

/// Counters kept under the cache lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Meta data of the buffer cache, protected by `SpinLock`.
#[derive(Debug)]
pub struct BCacheInner {
    meta: Vec<BufMeta>,
    /// One link per buffer plus the list head at index `meta.len()`.
    /// head.next is most recent, head.prev is least
    links: Vec<Link>,
    stats: BCacheStats,
}

impl BCacheInner {
    fn head(&self) -> usize {
        self.meta.len()
    }

    /// Moves the buffer with the given id to the front of the LRU list.
    fn move_to_front(&mut self, id: usize) {
        // from: prev -> current -> next
        // to:   prev -> next
        let Link { prev, next } = self.links[id];
        self.links[prev].next = next;
        self.links[next].prev = prev;

        // from: head -> first
        // to:   head -> current -> first
        let head = self.head();
        let first = self.links[head].next;
        self.links[id] = Link { prev: head, next: first };
        self.links[first].prev = id;
        self.links[head].next = id;
    }

    /// Least recently used buffer with no references that `accept` agrees to.
    fn find_lru(&self, accept: impl Fn(&BufMeta) -> bool) -> Option<usize> {
        // start from the tail
        let head = self.head();
        let mut i = self.links[head].prev;
        while i != head {
            let meta = &self.meta[i];
            if meta.ref_count == 0 && accept(meta) {
                return Some(i);
            }
            i = self.links[i].prev;
        }
        None
    }

    fn find_victim(&self, policy: EvictPolicy) -> Option<usize> {
        match policy {
            EvictPolicy::Lru => self.find_lru(|_| true),
            EvictPolicy::PreferClean => self
                .find_lru(|meta| !meta.dirty)
                .or_else(|| self.find_lru(|_| true)),
        }
    }
}

pub static BCACHE: OnceLock<BCache> = OnceLock::new();

/// Buffer cache.
///
/// The buffer cache is a linked list of buf structures holding cached copies of disk block
/// contents. Caching disk blocks in memory reduces the number of disk reads and also provides a
/// synchronization point for disk blocks used by multiple processes.
///
/// Interface:
/// * To get a buffer for a particular disk block, call `read()`.
/// * After changing buffer data, call `write()` to write it to disk.
/// * When done with the buffer, call `release()`.
/// * Do not use the buffer after calling `release()`.
/// * Only one process at a time can use a buffer, so do not keep them longer than necessary.
pub struct BCache {
    /// `SpinLock` protects metadata lookups and LRU manipulations.
    inner: SpinLock<BCacheInner>,
    /// Each buffer's data is protected by its own `SleepLock`.
    bufs: Vec<SleepLock<BufData>>,
    device: Box<dyn BlockDevice>,
    policy: EvictPolicy,
}

impl BCache {
    /// Creates a cache of `capacity` buffers over `device`, recycling buffers in LRU order.
    pub fn new(capacity: usize, device: impl BlockDevice + 'static) -> Result<Self, KernelError> {
        Self::with_policy(capacity, device, EvictPolicy::default())
    }

    pub fn with_policy(
        capacity: usize,
        device: impl BlockDevice + 'static,
        policy: EvictPolicy,
    ) -> Result<Self, KernelError> {
        if capacity == 0 {
            err!(KernelError::InvalidArgument);
        }

        // create a circular doubly-linked list
        // head -> 0 -> 1 -> ... -> capacity - 1 -> head
        let head = capacity;
        let links = (0..=capacity)
            .map(|i| Link {
                prev: if i == 0 { head } else { i - 1 },
                next: if i == head { 0 } else { i + 1 },
            })
            .collect();

        Ok(Self {
            inner: SpinLock::new(
                BCacheInner {
                    meta: alloc::vec![BufMeta::default(); capacity],
                    links,
                    stats: BCacheStats::default(),
                },
                "bcache",
            ),
            bufs: (0..capacity)
                .map(|_| SleepLock::new(BufData::new(), "buffer"))
                .collect(),
            device: Box::new(device),
            policy,
        })
    }

    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    pub fn policy(&self) -> EvictPolicy {
        self.policy
    }

    pub fn stats(&self) -> BCacheStats {
        self.inner.lock().stats
    }

    /// Looks through buffer cache for block on device `dev`.
    /// If not found, allocates a buffer.
    /// Returns the buffer locked; its content is only meaningful once `read()` marked it valid.
    pub fn get(&self, dev: u32, block_no: u32) -> Buf<'_> {
        let mut inner = self.inner.lock();

        // is the block already cached?
        let cached = inner.meta.iter().position(|meta| meta.key == Some((dev, block_no)));

        let id = match cached {
            Some(id) => {
                inner.stats.hits += 1;
                inner.meta[id].ref_count += 1;
                id
            }
            None => {
                // not cached
                // recycle an unused buffer
                let Some(id) = inner.find_victim(self.policy) else {
                    panic!("bcache get: no buffers");
                };

                inner.stats.misses += 1;
                let meta = &mut inner.meta[id];
                if let Some((old_dev, old_block)) = meta.key {
                    if meta.dirty {
                        log::warn!("bcache: dropping dirty block {old_block} of dev {old_dev}");
                    }
                    inner.stats.evictions += 1;
                }

                inner.meta[id] = BufMeta {
                    key: Some((dev, block_no)),
                    valid: false,
                    dirty: false,
                    ref_count: 1,
                    rebound: true,
                };
                id
            }
        };
        inner.move_to_front(id);
        drop(inner);

        // may sleep, so only after the cache lock is gone
        let mut guard = self.bufs[id].lock();
        // the previous owner's edits do not belong to the new block
        if core::mem::take(&mut self.inner.lock().meta[id].rebound) {
            guard.dirty = false;
        }
        Buf {
            id,
            dev,
            block_no,
            guard,
        }
    }

    /// Returns a locked buf with the contents of the indicated block.
    pub fn read(&self, dev: u32, block_no: u32) -> Result<Buf<'_>, KernelError> {
        let mut buf = self.get(dev, block_no);

        let valid = self.inner.lock().meta[buf.id].valid;
        if !valid {
            // read from disk
            if let Err(e) = self.device.read(dev, block_no, &mut buf.guard.data) {
                self.release(buf);
                err!(e);
            }
            buf.guard.dirty = false;

            self.inner.lock().meta[buf.id].valid = true;
        }

        Ok(buf)
    }

    /// Writes `buf`'s contents to disk.
    pub fn write(&self, buf: &mut Buf<'_>) -> Result<(), KernelError> {
        // buf must be locked since it holds the sleep lock guard
        try_log!(self.device.write(buf.dev, buf.block_no, &buf.guard.data));
        buf.guard.dirty = false;
        Ok(())
    }

    /// Releases a locked buffer.
    /// Moves to the head of the most-recently-used list.
    pub fn release(&self, buf: Buf<'_>) {
        let id = buf.id;
        let dirty = buf.guard.dirty;
        drop(buf);

        let mut inner = self.inner.lock();
        let meta = &mut inner.meta[id];
        meta.dirty = dirty;
        meta.ref_count -= 1;

        if meta.ref_count == 0 {
            // no one is waiting for it
            inner.move_to_front(id);
        }
    }

    /// Artificially increments the reference count for the buffer so that it is not recycled.
    pub fn pin(&self, buf: &Buf<'_>) -> BufId {
        let mut inner = self.inner.lock();
        inner.meta[buf.id].ref_count += 1;
        buf.id()
    }

    /// Artificially decrements the reference count for the buffer.
    pub fn unpin(&self, id: BufId) {
        let mut inner = self.inner.lock();
        let meta = &mut inner.meta[id.0];
        assert!(meta.ref_count > 0, "bcache unpin: not pinned");
        meta.ref_count -= 1;
    }
}

impl core::fmt::Debug for BCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BCache")
            .field("capacity", &self.capacity())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Initialize the buffer cache.
///
/// Must be called only once; a second call panics.
pub fn init(capacity: usize, device: impl BlockDevice + 'static) -> Result<(), KernelError> {
    let first = BCACHE.initialize(|| BCache::new(capacity, device))?;
    assert!(first, "bcache init twice");

    log::info!("buf  init");
    Ok(())
}

/// Returns the buffer cache.
pub fn bcache() -> &'static BCache {
    BCACHE.get().expect("bcache to be init")
}
