#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

use x86_64::instructions::hlt;

pub mod boot;
pub mod constants;
pub mod devices;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;

pub use devices::serial;

pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}
