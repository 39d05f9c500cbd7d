// SPDX-License-Identifier: Apache-2.0
//! Captures the git branch and latest commit title at build time so
//! `/version` can report more than the crate's semver. Falls back to
//! `"unknown"` for anything git can't answer (shallow clones, detached
//! source tarballs, CI without a `.git` directory).

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn main() {
    let branch =
        git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let commit_title =
        git(&["log", "-1", "--pretty=%s"]).unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_BRANCH={branch}");
    println!("cargo:rustc-env=GIT_COMMIT_TITLE={commit_title}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
