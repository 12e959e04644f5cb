//! Build script: embeds the git hash and sanity-checks GPU toolkits before
//! whisper-rs-sys starts compiling, so feature-flag mistakes fail fast.

use std::process::Command;

fn main() {
    // Embed git short hash for version string
    if let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        && output.status.success()
    {
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");

    if cfg!(feature = "cuda") && Command::new("nvcc").arg("--version").output().is_err() {
        panic!(
            "`nvcc` not found — the CUDA toolkit is not installed.\n\
             Install it from https://developer.nvidia.com/cuda-downloads\n\
             or build without CUDA: cargo build --release"
        );
    }

    if cfg!(feature = "vulkan")
        && Command::new("vulkaninfo")
            .arg("--summary")
            .output()
            .is_err()
    {
        panic!(
            "`vulkaninfo` not found — the Vulkan SDK is not installed.\n\
             Install it from https://vulkan.lunarg.com/\n\
             or build without Vulkan: cargo build --release"
        );
    }

    if cfg!(feature = "hipblas") && Command::new("rocminfo").output().is_err() {
        panic!(
            "`rocminfo` not found — ROCm is not installed.\n\
             Install it from https://rocm.docs.amd.com/\n\
             or build without HipBLAS: cargo build --release"
        );
    }

    if cfg!(feature = "openblas") {
        let pkg_config_ok = Command::new("pkg-config")
            .args(["--exists", "openblas"])
            .status()
            .is_ok_and(|s| s.success());
        let lib_exists = ["/usr/lib/x86_64-linux-gnu", "/usr/lib", "/usr/lib64"]
            .iter()
            .any(|dir| std::path::Path::new(dir).join("libopenblas.so").exists());
        if !pkg_config_ok && !lib_exists {
            panic!(
                "OpenBLAS not found. Install it (e.g. `sudo apt install libopenblas-dev`)\n\
                 or build without OpenBLAS: cargo build --release"
            );
        }
    }
}
