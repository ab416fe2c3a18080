use thiserror::Error;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("alloc error")]
    Alloc,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of proc")]
    OutOfProc,
    #[error("spawn failed")]
    Spawn,
    #[error("vm error: {0}")]
    Vm(#[from] VmError),
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
}

/// Address translation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("unmapped address")]
    Unmapped,
    #[error("page table allocation failed")]
    Alloc,
}

/// Block device errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("no such device {0}")]
    NoDevice(u32),
    #[error("block {0} out of range")]
    OutOfRange(u32),
    #[error("device shut down")]
    Offline,
}

/// Return an error, logging file:line. Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        ::log::error!(
            "hart {} errored at {}:{}: {}",
            $crate::proc::current_id(),
            file!(),
            line!(),
            $e
        );
        return Err($e.into());
    }};
}

/// Propagate error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                ::log::error!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
