//! Exit status and output of the `proxyboot` binary against the simulated
//! target.

use std::path::Path;
use std::process::{Command, Output};

use proxyboot::fdt::FdtBuilder;

fn proxyboot(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_proxyboot"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("PROXYBOOT_DEBUG")
        .output()
        .unwrap()
}

fn write(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_dt_prepare_failure_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = write(dir.path(), "Image", &[0x5a; 0x1000]);
    let dtb = write(dir.path(), "garbage.dtb", b"this is not a flattened device tree");

    let out = proxyboot(&["--dry-run", "linux", &kernel, &dtb]);

    assert_eq!(out.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("DT prepare failed"), "stdout: {}", stdout);
}

#[test]
fn test_dry_run_boot_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = FdtBuilder::new();
    b.begin_node("");
    b.property_u32("#address-cells", 2);
    b.property_u32("#size-cells", 2);
    b.begin_node("chosen");
    b.end_node();
    b.end_node();
    let kernel = write(dir.path(), "Image", &[0x5a; 0x1000]);
    let dtb = write(dir.path(), "board.dtb", &b.finish().unwrap());
    let saved = dir.path().join("patched.dtb");

    let out = proxyboot(&[
        "--dry-run",
        "linux",
        &kernel,
        &dtb,
        "-b",
        "console=ttyS0",
        "-r",
        saved.to_str().unwrap(),
    ]);

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(saved.exists());
}

#[test]
fn test_unrepresentable_timeout_is_an_error() {
    let out = proxyboot(&["--dry-run", "--timeout", "1e30", "info"]);

    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("invalid timeout"), "stderr: {}", stderr);
}

#[test]
fn test_missing_kernel_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("Image");

    let out = proxyboot(&[
        "--dry-run",
        "linux",
        missing.to_str().unwrap(),
        missing.to_str().unwrap(),
    ]);

    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Error:"));
}
