pub mod gdt;

pub fn init() {
    gdt::init();
}
