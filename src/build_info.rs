// SPDX-License-Identifier: Apache-2.0
//! Build-time metadata surfaced by the `/version` control command.

/// Display version, git branch, and latest commit title, all resolved at
/// compile time — the branch/commit fields come from `build.rs`, the
/// version from Cargo itself.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_branch: &'static str,
    pub git_commit_title: &'static str,
}

pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    git_branch: env!("GIT_BRANCH"),
    git_commit_title: env!("GIT_COMMIT_TITLE"),
};

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chatrelay {} (branch: {}, commit: {})",
            self.version, self.git_branch, self.git_commit_title
        )
    }
}
