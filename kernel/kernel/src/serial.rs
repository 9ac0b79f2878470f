//! # 16550 Serial Logging
//!
//! Installs the kernel's primary [`log::Log`] implementor: a polled,
//! interrupt-free 16550-compatible UART on COM1 (`0x3F8`), 115200-8N1. All
//! `log!`/`info!`/`warn!`/`error!` output in the kernel goes here.
//!
//! Mirrors [`kernel_qemu::logger::QemuLogger`]'s shape (one `static`, installed
//! once via `log::set_logger`); that logger is kept as a secondary backend
//! behind the `qemu` feature for use under test/CI.

use crate::ports::{inb, outb};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

const COM1: u16 = 0x3F8;

/// Bring up the COM1 UART: disable its interrupts, set the baud-rate divisor
/// for 115200, and configure 8 data bits / no parity / 1 stop bit.
fn init_com1() {
    unsafe {
        outb(COM1 + 1, 0x00); // disable all UART interrupts
        outb(COM1 + 3, 0x80); // enable DLAB to set the baud rate divisor
        outb(COM1, 0x01); // divisor low byte: 115200 baud
        outb(COM1 + 1, 0x00); // divisor high byte
        outb(COM1 + 3, 0x03); // 8 bits, no parity, one stop bit; DLAB off
        outb(COM1 + 2, 0xC7); // enable FIFO, clear it, 14-byte threshold
        outb(COM1 + 4, 0x0B); // IRQs disabled, RTS/DSR set
    }
}

fn transmit_empty() -> bool {
    unsafe { inb(COM1 + 5) & 0x20 != 0 }
}

/// Write a raw byte to COM1, bypassing the `\n` → `\r\n` translation
/// [`write_str`] does for log lines. Used by the `write` syscall, which
/// writes the user buffer verbatim.
pub fn write_byte(c: u8) {
    putc(c);
}

fn putc(c: u8) {
    while !transmit_empty() {
        core::hint::spin_loop();
    }
    unsafe { outb(COM1, c) }
}

fn write_str(s: &str) {
    for &b in s.as_bytes() {
        if b == b'\n' {
            putc(b'\r');
        }
        putc(b);
    }
}

struct Com1Writer;

impl core::fmt::Write for Com1Writer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        write_str(s);
        Ok(())
    }
}

pub struct SerialLogger {
    max_level: LevelFilter,
}

impl SerialLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Bring up COM1 and install this logger as the global `log` sink.
    ///
    /// Call once during early boot, before interrupts are enabled.
    #[allow(clippy::missing_errors_doc)]
    pub fn init(self) -> Result<(), SetLoggerError> {
        init_com1();

        let max_level = self.max_level;
        static mut LOGGER: Option<SerialLogger> = None;

        #[allow(static_mut_refs)]
        unsafe {
            LOGGER = Some(self);
            log::set_logger(LOGGER.as_ref().unwrap() as &'static dyn Log)?;
        }
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        use core::fmt::Write;
        let _ = writeln!(
            Com1Writer,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );

        #[cfg(feature = "qemu")]
        kernel_qemu::qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
