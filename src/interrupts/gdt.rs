use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::constants::gdt::{DOUBLE_FAULT_IST_INDEX, IST_STACK_SIZE, RING0_STACK_SIZE};

const GDT_ENTRIES: usize = 7; // Null + kernel code/data + user code/data + TSS (2 entries)

#[repr(align(16))]
struct Stack<const N: usize>([u8; N]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        static mut DOUBLE_FAULT_STACK: Stack<IST_STACK_SIZE> = Stack([0; IST_STACK_SIZE]);
        static mut RING0_STACK: Stack<RING0_STACK_SIZE> = Stack([0; RING0_STACK_SIZE]);

        let mut tss = TaskStateSegment::new();
        // the stacks are only ever handed to the CPU, here, once
        let double_fault = VirtAddr::from_ptr(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            double_fault + IST_STACK_SIZE as u64;

        // where the CPU lands on a trap or interrupt out of ring 3
        let ring0 = VirtAddr::from_ptr(core::ptr::addr_of!(RING0_STACK));
        tss.privilege_stack_table[0] = ring0 + RING0_STACK_SIZE as u64;
        tss
    };

    static ref GDT: (GlobalDescriptorTable<GDT_ENTRIES>, Selectors) = {
        let mut gdt = GlobalDescriptorTable::<GDT_ENTRIES>::empty();

        // Add segments
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));

        (gdt, Selectors {
            code_selector,
            data_selector,
            user_code_selector,
            user_data_selector,
            tss_selector,
        })
    };
}

#[derive(Debug)]
struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Selectors for a ring 3 frame: `(code, data)`, RPL 3.
pub fn user_selectors() -> (SegmentSelector, SegmentSelector) {
    (GDT.1.user_code_selector, GDT.1.user_data_selector)
}

pub fn init() {
    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code_selector);

        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);

        load_tss(GDT.1.tss_selector);
    }
}
