use std::env;
use std::process::Command;

/// Packaged builds have no `.git`; the release pipeline passes the revision in.
const SHA_OVERRIDE: &str = "POS_SYNC_BUILD_SHA";

fn main() {
    println!("cargo:rerun-if-env-changed={SHA_OVERRIDE}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let revision = env::var(SHA_OVERRIDE)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(git_describe)
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=POS_SYNC_REVISION={revision}");
}

/// `git describe --always --dirty`, e.g. `3f2a9c1-dirty`.
fn git_describe() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let described = String::from_utf8(out.stdout).ok()?;
    Some(described.trim().to_string()).filter(|s| !s.is_empty())
}
