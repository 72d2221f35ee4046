#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::arch::global_asm;
    use core::ptr::addr_of;

    use log::error;
    use taiga::{
        boot::{BootInfo, KernelImage},
        constants::{memory::KERNEL_VIRT_BASE, processes::INIT_BINARY},
        idle_loop, init,
        memory::frame_allocator::with_frame_allocator,
        processes::process::{create_process, run_process_ring3},
        serial_println,
    };
    use x86_64::PhysAddr;

    const BOOT_STACK_SIZE: usize = 64 * 1024;

    #[repr(align(16))]
    struct BootStack([u8; BOOT_STACK_SIZE]);

    /// Lives in .bss, so in the higher half and mapped in every address space.
    static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

    extern "C" {
        static _kernel_start: u8;
        static _kernel_end: u8;
    }

    // The loader jumps here on its own stack with the BootInfo pointer in
    // rdi; move to the boot stack and keep rdi for kernel_main.
    global_asm!(
        ".section .text._start, \"ax\"",
        ".global _start",
        "_start:",
        "    lea rsp, [rip + {stack} + {size}]",
        "    xor ebp, ebp",
        "    call {main}",
        "2:  hlt",
        "    jmp 2b",
        stack = sym BOOT_STACK,
        size = const BOOT_STACK_SIZE,
        main = sym kernel_main,
    );

    /// Physical bounds of the image, from the link-time symbols.
    fn kernel_image() -> KernelImage {
        // linker-provided symbols; only their addresses are used
        let start = addr_of!(_kernel_start) as u64;
        let end = addr_of!(_kernel_end) as u64;
        KernelImage::new(
            PhysAddr::new(start - KERNEL_VIRT_BASE),
            PhysAddr::new(end - KERNEL_VIRT_BASE),
        )
    }

    extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
        let vmm = match unsafe { init::init(boot_info, kernel_image()) } {
            Ok(vmm) => vmm,
            Err(err) => {
                error!("boot failed: {}", err);
                idle_loop();
            }
        };

        let process = match with_frame_allocator(|frames| create_process(INIT_BINARY, vmm, frames))
        {
            Ok(process) => process,
            Err(err) => {
                error!("could not start init: {}", err);
                idle_loop();
            }
        };

        // SAFETY: the GDT is loaded and we are on the boot stack.
        unsafe { run_process_ring3(&process, vmm) }
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        idle_loop();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
