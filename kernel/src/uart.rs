//! NS16550-compatible UART at 0x1000_0000 (QEMU `virt`). Out of the
//! specified core (§1 names the console driver an external collaborator);
//! kept thin on purpose, just enough to give the rest of the kernel a byte
//! sink and a blocking byte source.

use crate::config::UART0_BASE;
use core::fmt;
use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;

const THR_OFFSET: usize = 0; // transmit holding register (write)
const RHR_OFFSET: usize = 0; // receive holding register (read)
const LSR_OFFSET: usize = 5; // line status register
const LSR_RX_READY: u8 = 0x01;
const LSR_TX_IDLE: u8 = 0x20;

pub struct Uart {
    base: usize,
}

impl Uart {
    const fn new(base: usize) -> Self {
        Uart { base }
    }

    fn reg(&self, offset: usize) -> *mut u8 {
        (self.base + offset) as *mut u8
    }

    pub fn putc(&mut self, c: u8) {
        unsafe {
            while read_volatile(self.reg(LSR_OFFSET)) & LSR_TX_IDLE == 0 {}
            write_volatile(self.reg(THR_OFFSET), c);
        }
    }

    /// Blocks until a byte is available.
    pub fn getc(&mut self) -> u8 {
        unsafe {
            while read_volatile(self.reg(LSR_OFFSET)) & LSR_RX_READY == 0 {}
            read_volatile(self.reg(RHR_OFFSET))
        }
    }

    /// Non-blocking read, used by the interrupt path once external IRQs are
    /// wired up; returns `None` if nothing is pending.
    pub fn try_getc(&mut self) -> Option<u8> {
        unsafe {
            if read_volatile(self.reg(LSR_OFFSET)) & LSR_RX_READY != 0 {
                Some(read_volatile(self.reg(RHR_OFFSET)))
            } else {
                None
            }
        }
    }

    pub fn write_bytes(&mut self, buf: &[u8]) {
        for &b in buf {
            if b == b'\n' {
                self.putc(b'\r');
            }
            self.putc(b);
        }
    }
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

pub static SERIAL: Mutex<Uart> = Mutex::new(Uart::new(UART0_BASE));

#[macro_export]
macro_rules! kernel_log {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let _ = write!($crate::uart::SERIAL.lock(), $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! kernel_log_line {
    () => { $crate::kernel_log!("\n") };
    ($($arg:tt)*) => {
        $crate::kernel_log!($($arg)*);
        $crate::kernel_log!("\n");
    };
}
