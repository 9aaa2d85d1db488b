//! Build script: emits link directives for a statically linked VM monitor.
//!
//! Only active with the `static-engine` feature. The library directory comes
//! from `JIT_LAUNCHER_ENGINE_LIB_DIR` and the library name from
//! `JIT_LAUNCHER_ENGINE_LIB` (default `qemu-system-aarch64`).

use std::env;

const DEFAULT_ENGINE_LIB: &str = "qemu-system-aarch64";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=JIT_LAUNCHER_ENGINE_LIB_DIR");
    println!("cargo:rerun-if-env-changed=JIT_LAUNCHER_ENGINE_LIB");

    if env::var_os("CARGO_FEATURE_STATIC_ENGINE").is_none() {
        return;
    }

    if let Ok(dir) = env::var("JIT_LAUNCHER_ENGINE_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
    }

    let lib = env::var("JIT_LAUNCHER_ENGINE_LIB").unwrap_or_else(|_| DEFAULT_ENGINE_LIB.to_string());
    println!("cargo:rustc-link-lib={lib}");
}
