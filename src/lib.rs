extern crate alloc;

#[macro_use]
pub mod error;

pub mod buf;
pub mod disk;
pub mod kalloc;
pub mod memlayout;
pub mod param;
pub mod printf;
pub mod proc;
pub mod riscv;
pub mod sleeplock;
pub mod spinlock;
pub mod sync;
pub mod trap;
pub mod vm;
