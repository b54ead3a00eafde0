#![allow(dead_code)]

use std::{fs, path::Path};

use assert_cmd::assert::Assert;
use serde_json::{json, Value};

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

pub fn stdout(assert: &Assert) -> String {
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout")
}

pub fn stderr(assert: &Assert) -> String {
    String::from_utf8(assert.get_output().stderr.clone()).expect("utf8 stderr")
}

pub fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_vec_pretty(value).expect("encode")).expect("write fixture");
}

pub fn package(name: &str, first_install_time_ms: u64) -> Value {
    json!({
        "name": name,
        "splits": [{ "path": format!("/data/app/{name}/base.apk") }],
        "first_install_time_ms": first_install_time_ms,
    })
}

/// A ledger in which each `(owner, last_used_at_ms)` loaded its own base APK once.
pub fn ledger(uses: &[(&str, u64)]) -> Value {
    let packages: serde_json::Map<String, Value> = uses
        .iter()
        .map(|(owner, at)| {
            (
                (*owner).to_string(),
                json!({
                    "primary": [{
                        "dex_path": format!("/data/app/{owner}/base.apk"),
                        "records": [{ "loading_package": owner, "last_used_at_ms": at }],
                    }],
                }),
            )
        })
        .collect();
    json!({ "version": 1, "packages": packages })
}
