use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::json;
use tempfile::TempDir;

mod common;

use common::{ledger, package, parse_json, stderr, stdout, write_json, DAY_MS};

/// Inventory of three apps plus a launcher and system UI, and a ledger where only
/// `com.used` ever ran.
fn fixture() -> (TempDir, PathBuf, PathBuf) {
    let temp = tempfile::tempdir().expect("tempdir");
    let inventory = temp.path().join("packages.json");
    write_json(
        &inventory,
        &json!({
            "packages": [
                package("com.used", DAY_MS),
                package("com.fresh", 9 * DAY_MS + DAY_MS / 2),
                package("com.old", 100),
                package("com.launcher", 50),
                package("com.systemui", 50),
            ],
            "system_ui": "com.systemui",
            "launcher": "com.launcher",
        }),
    );
    let ledger_path = temp.path().join("ledger.json");
    write_json(&ledger_path, &ledger(&[("com.used", 9 * DAY_MS + DAY_MS / 2)]));
    (temp, inventory, ledger_path)
}

fn plan_json(inventory: &Path, ledger_path: &Path, reason: &str) -> serde_json::Value {
    let assert = cargo_bin_cmd!("dexopt")
        .env_remove("DEXOPT_DOWNGRADE_AFTER_INACTIVE_DAYS")
        .args(["--json", "plan", "--reason", reason, "--now-ms"])
        .arg((10 * DAY_MS).to_string())
        .arg("--inventory")
        .arg(inventory)
        .arg("--ledger")
        .arg(ledger_path)
        .assert()
        .success();
    parse_json(&assert)
}

#[test]
fn first_boot_selects_everything_with_verify() {
    let (_temp, inventory, ledger_path) = fixture();
    let payload = plan_json(&inventory, &ledger_path, "first-boot");
    let details = &payload["details"];
    assert_eq!(details["reason"], "first-boot");
    assert_eq!(
        details["packages"],
        json!(["com.fresh", "com.launcher", "com.old", "com.systemui", "com.used"])
    );
    assert_eq!(details["params"]["compiler_filter"], "verify");
    assert_eq!(details["params"]["priority"], "boot");
}

#[test]
fn bg_dexopt_puts_never_used_packages_first() {
    let (_temp, inventory, ledger_path) = fixture();
    let payload = plan_json(&inventory, &ledger_path, "bg-dexopt");
    assert_eq!(
        payload["details"]["packages"],
        json!(["com.fresh", "com.old", "com.launcher", "com.systemui", "com.used"])
    );
    assert_eq!(payload["details"]["params"]["compiler_filter"], "speed-profile");
}

#[test]
fn boot_after_ota_compiles_ui_packages_harder() {
    let (_temp, inventory, ledger_path) = fixture();
    let payload = plan_json(&inventory, &ledger_path, "boot-after-ota");
    assert_eq!(
        payload["details"]["params"]["package_filter_overrides"],
        json!({ "com.launcher": "speed-profile", "com.systemui": "speed" })
    );
}

#[test]
fn mainline_update_selects_only_ui_packages() {
    let (_temp, inventory, ledger_path) = fixture();
    let payload = plan_json(&inventory, &ledger_path, "boot-after-mainline-update");
    assert_eq!(
        payload["details"]["packages"],
        json!(["com.systemui", "com.launcher"])
    );
}

#[test]
fn inactive_reason_uses_configured_window() {
    let (_temp, inventory, ledger_path) = fixture();
    let assert = cargo_bin_cmd!("dexopt")
        .env("DEXOPT_DOWNGRADE_AFTER_INACTIVE_DAYS", "1")
        .args(["--json", "plan", "--reason", "inactive", "--now-ms"])
        .arg((10 * DAY_MS).to_string())
        .arg("--inventory")
        .arg(&inventory)
        .arg("--ledger")
        .arg(&ledger_path)
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(
        payload["details"]["packages"],
        json!(["com.launcher", "com.systemui", "com.old"])
    );
}

#[test]
fn human_output_lists_numbered_packages() {
    let (_temp, inventory, ledger_path) = fixture();
    let assert = cargo_bin_cmd!("dexopt")
        .args(["plan", "--reason", "boot-after-mainline-update", "--inventory"])
        .arg(&inventory)
        .arg("--ledger")
        .arg(&ledger_path)
        .assert()
        .success();
    let output = stdout(&assert);
    assert!(output.contains("reason: boot-after-mainline-update"), "{output}");
    assert!(output.contains("compiler filter: verify"), "{output}");
    assert!(output.contains("com.launcher: speed-profile"), "{output}");
    assert!(output.contains("packages (2):"), "{output}");
    assert!(output.contains("  1. com.systemui"), "{output}");
    assert!(output.contains("  2. com.launcher"), "{output}");
}

#[test]
fn unknown_reason_is_rejected() {
    let (_temp, inventory, _ledger) = fixture();
    let assert = cargo_bin_cmd!("dexopt")
        .args(["plan", "--reason", "nightly", "--inventory"])
        .arg(&inventory)
        .assert()
        .failure();
    let err = stderr(&assert);
    assert!(err.contains("unknown reason 'nightly'"), "{err}");
}

#[test]
fn missing_inventory_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = cargo_bin_cmd!("dexopt")
        .args(["plan", "--reason", "first-boot", "--inventory"])
        .arg(temp.path().join("absent.json"))
        .arg("--ledger")
        .arg(temp.path().join("ledger.json"))
        .assert()
        .failure();
    let err = stderr(&assert);
    assert!(err.contains("failed to read"), "{err}");
}
