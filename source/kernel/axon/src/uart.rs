// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! 16550 console on the QEMU `virt` machine.

use core::fmt::{self, Write};
use spin::Mutex;

const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart { base: UART0_BASE });

/// Console writer shared by the logger.
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Returns a guard for the console singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    fn put(&self, byte: u8) {
        // SAFETY: `base` is the identity-mapped MMIO window of UART0.
        unsafe {
            while core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
            core::ptr::write_volatile((self.base + UART_TX) as *mut u8, byte);
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}

/// Lock-free writer for panic context, where the console lock may already be held.
#[cfg(feature = "panic_handler")]
pub fn raw_writer() -> KernelUart {
    KernelUart { base: UART0_BASE }
}
