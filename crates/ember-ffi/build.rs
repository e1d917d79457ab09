//! Build script for ember-ffi.
//!
//! Links Apple's Accelerate framework when the `accelerate` feature is
//! enabled and the target is macOS.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let accelerate = std::env::var_os("CARGO_FEATURE_ACCELERATE").is_some();
    if !accelerate {
        return;
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "macos" {
        println!(
            "cargo:warning=`accelerate` feature requested for target_os={}, building without vendor BLAS",
            target_os
        );
        return;
    }

    println!("cargo:rustc-link-lib=framework=Accelerate");
}
