//! Kernel log output.
//!
//! Records from the `log` facade are written one line at a time under the printf lock, each
//! prefixed with the hart that produced it.

use std::io::Write;

use crate::proc;
use crate::spinlock::SpinLock;

pub static PRINTF: Printf = Printf {
    writer: SpinLock::new(Writer, "printf"),
};

pub struct Printf {
    writer: SpinLock<Writer>,
}

pub struct Writer;

impl Writer {
    fn print(&mut self, line: &str) {
        // the console is the host's stderr; a failed write has nowhere to be reported
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

impl log::Log for Printf {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // format before taking the lock, the arguments may take locks of their own
        let line = format!(
            "hart {:<3} {:5} {}: {}\n",
            proc::current_id(),
            record.level(),
            record.target(),
            record.args()
        );

        self.writer.lock().print(&line);
    }

    fn flush(&self) {}
}

/// Installs the kernel logger. Later calls are no-ops.
pub fn init() {
    if log::set_logger(&PRINTF).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }
}
