//! Filesystem snapshot engine
//!
//! Content-addressed COW layers of a guest root filesystem. A layer is an
//! immutable manifest (path → mode/owner/hash/symlink) plus blobs in a
//! shared store; a snapshot is a chain of layers, newest last. Identity is
//! `sha256(parent_id ∥ manifest_bytes)`, stable across runs so repeated
//! Dockerfile commands hit the cache. Built snapshots re-materialize as
//! [`crate::source::InstanceSource`]s for subsequent VMs.

pub mod builder;
pub mod dockerfile;
pub mod layer;
pub mod store;

pub use builder::{BuildContext, BuildOp, RunExecutor, SnapshotChain, SnapshotFactory};
pub use dockerfile::parse_dockerfile;
pub use layer::{LayerEntry, LayerId, LayerManifest};
pub use store::SnapshotStore;

/// Match `path` (forward-slash separated, relative) against a glob pattern.
/// Supports `*` (within one component), `?`, and `**` (across components).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn match_parts(pat: &[&str], path: &[&str]) -> bool {
        match (pat.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                // `**` absorbs zero or more components.
                match_parts(&pat[1..], path)
                    || (!path.is_empty() && match_parts(pat, &path[1..]))
            }
            (Some(p), Some(c)) => match_component(p, c) && match_parts(&pat[1..], &path[1..]),
            _ => false,
        }
    }

    fn match_component(pat: &str, comp: &str) -> bool {
        let pat: Vec<char> = pat.chars().collect();
        let comp: Vec<char> = comp.chars().collect();
        match_chars(&pat, &comp)
    }

    fn match_chars(pat: &[char], comp: &[char]) -> bool {
        match (pat.first(), comp.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                match_chars(&pat[1..], comp)
                    || (!comp.is_empty() && match_chars(pat, &comp[1..]))
            }
            (Some('?'), Some(_)) => match_chars(&pat[1..], &comp[1..]),
            (Some(p), Some(c)) if p == c => match_chars(&pat[1..], &comp[1..]),
            _ => false,
        }
    }

    let pat_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_parts(&pat_parts, &path_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_single_star_stays_in_component() {
        assert!(glob_match("*.log", "boot.log"));
        assert!(!glob_match("*.log", "var/log/boot.log"));
        assert!(glob_match("var/*.log", "var/boot.log"));
    }

    #[test]
    fn glob_double_star_crosses_components() {
        assert!(glob_match("**/*.tmp", "a/b/c/x.tmp"));
        assert!(glob_match("proc/**", "proc/1/status"));
        assert!(glob_match("**", "anything/at/all"));
        assert!(!glob_match("sys/**", "proc/1"));
    }

    #[test]
    fn glob_question_mark() {
        assert!(glob_match("tmp/file?", "tmp/file1"));
        assert!(!glob_match("tmp/file?", "tmp/file12"));
    }

    #[test]
    fn glob_exact() {
        assert!(glob_match("etc/hostname", "etc/hostname"));
        assert!(!glob_match("etc/hostname", "etc/hosts"));
    }
}
