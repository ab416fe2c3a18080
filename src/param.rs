/// maximum number of processes (kernel threads attached to a process slot)
pub const NPROC: usize = 256;
/// max # of blocks any FS op writes
pub const MAXOPBLOCKS: usize = 10;
/// size of disk block cache
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// block size
pub const BSIZE: usize = 1024;
/// device number of file system root disk
pub const ROOTDEV: u32 = 1;
/// size of file system in blocks
pub const FSSIZE: usize = 2000;
/// physical frames handed to the kernel page allocator
pub const NFRAMES: usize = 1024;
