/// Kernel build script.
///
/// Links the kernel binary with `linker.ld` when building for a bare-metal
/// target. Host builds (unit tests) use the platform linker untouched.
fn main() {
    let target = std::env::var("TARGET").unwrap_or_default();
    println!("cargo:rerun-if-changed=linker.ld");
    println!("cargo:rerun-if-changed=user/spin.elf");

    if !target.contains("none") {
        return;
    }

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_default();
    println!("cargo:rustc-link-arg-bins=-T{}/linker.ld", manifest_dir);
    println!("cargo:rustc-link-arg-bins=--no-dynamic-linker");
}
