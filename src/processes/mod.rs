pub mod elf;
pub mod loader;
pub mod process;
