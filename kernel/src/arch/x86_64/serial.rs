//! Serial console logging
//!
//! Backs the `log` facade with COM1 (0x3F8), which QEMU exposes as its
//! serial console. Records are written as `[LEVEL] target: message`.

use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;
use x86_64::instructions::port::{Port, PortReadOnly};

/// COM1 port address
const COM1: u16 = 0x3F8;

/// Line status register: transmit holding register empty
const LSR_THR_EMPTY: u8 = 0x20;

/// A 16550 UART already initialized by the loader
pub struct SerialPort {
    data: Port<u8>,
    line_status: PortReadOnly<u8>,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            line_status: PortReadOnly::new(base + 5),
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            while self.line_status.read() & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// `log` backend writing to a serial port
pub struct SerialLogger {
    port: Mutex<SerialPort>,
}

impl SerialLogger {
    pub const fn new(base: u16) -> Self {
        Self {
            port: Mutex::new(SerialPort::new(base)),
        }
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = self.port.lock();
        let _ = writeln!(port, "[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger::new(COM1);

/// Route `log` records to COM1
///
/// Fails if another logger was installed first.
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Metadata};

    #[test]
    fn test_logger_follows_max_level() {
        let logger = SerialLogger::new(COM1);
        let error = Metadata::builder().level(Level::Error).target("ke").build();
        let trace = Metadata::builder().level(Level::Trace).target("ke").build();

        log::set_max_level(LevelFilter::Warn);
        assert!(logger.enabled(&error));
        assert!(!logger.enabled(&trace));
    }
}
