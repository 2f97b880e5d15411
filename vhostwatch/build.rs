use std::{
    env,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

const EBPF_PACKAGE_DIR: &str = "../vhostwatch-ebpf";
const EBPF_BINARY: &str = "vhostwatch";

fn bpf_target(arch: &str) -> &'static str {
    match arch {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" | "loongarch64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" | "sparc64" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    }
}

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    println!("cargo:rerun-if-changed={}/src", EBPF_PACKAGE_DIR);
    println!("cargo:rerun-if-changed=../vhostwatch-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").expect("CARGO_CFG_TARGET_ARCH not set");
    let target = bpf_target(&arch);

    // A separate target directory keeps the nested cargo from waiting on the
    // lock held by the outer build.
    let ebpf_target_dir = env::var_os("VHOSTWATCH_EBPF_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| out_dir.join("ebpf-target"));

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(Path::new(EBPF_PACKAGE_DIR))
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", target),
            "-Z",
            "build-std=core",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .expect("Failed to execute cargo for the eBPF object");

    if !status.success() {
        panic!("Failed to build eBPF object for {}", target);
    }

    let ebpf_binary = ebpf_target_dir
        .join(target)
        .join("release")
        .join(EBPF_BINARY);
    std::fs::copy(&ebpf_binary, out_dir.join(EBPF_BINARY))
        .expect("Failed to copy eBPF object into OUT_DIR");
}
