//! Locates and links `libcec` for the native adapter (`src/cec/ffi.rs`).
//! Tries `pkg-config` first, the way distro-packaged `libcec` ships a
//! `.pc` file; falls back to the linker's default search path (a bare
//! `-lcec`) for installs without one.

fn main() {
    if let Err(e) = pkg_config::Config::new().probe("libcec") {
        println!("cargo:warning=pkg-config could not locate libcec ({e}); falling back to -lcec on the default linker search path");
        println!("cargo:rustc-link-lib=cec");
    }
}
