// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal builds
//! OWNERS: @kernel-team
//! DEPENDS_ON: uart::raw_writer()
//! INVARIANTS: No allocation; never returns

use core::{fmt::Write, panic::PanicInfo};

use crate::uart;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = write!(w, "{}\n", info.message());

    loop {
        #[allow(unused_unsafe)]
        // SAFETY: `wfi` only stalls the hart until the next interrupt.
        unsafe {
            riscv::asm::wfi()
        };
    }
}
