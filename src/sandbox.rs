//! Path Sandbox: normalize user-supplied paths against a session cwd and
//! the server root; reject escapes before any filesystem syscall runs.
//!
//! No symlink resolution is performed here; a resolved path is checked for
//! boundary containment purely as a string prefix.

use crate::error::{CsapError, CsapResult};

/// A `PATH_MAX`-style ceiling; `String` has no fixed capacity, so this
/// bounds how large a resolved path may grow rather than guarding a fixed
/// buffer.
const MAX_PATH_LEN: usize = 4096;

/// Resolve `input` to an absolute, normalized path.
///
/// Absolute input (`input` starts with `/`) is rooted at `root`; relative
/// input is rooted at `base_abs` (the caller's cwd, always absolute).
pub fn resolve(root: &str, base_abs: &str, input: &str) -> CsapResult<String> {
    if input.is_empty() {
        return Err(CsapError::invalid("empty path"));
    }

    let candidate = if let Some(rest) = input.strip_prefix('/') {
        format!("{root}/{rest}")
    } else {
        format!("{base_abs}/{input}")
    };

    if candidate.len() >= MAX_PATH_LEN {
        return Err(CsapError::invalid("path too long"));
    }

    normalize(&candidate)
}

/// Collapse `.`/`..`/empty segments, never ascending past the leading `/`.
fn normalize(candidate: &str) -> CsapResult<String> {
    let mut stack: Vec<&str> = Vec::new();
    for segment in candidate.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    // already at the filesystem root; never overflow below it
                }
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", stack.join("/")))
    }
}

/// True iff `child` equals `parent`, or begins with `parent` followed by
/// `/`. Pure string comparison; callers must pass normalized paths.
pub fn is_within(parent: &str, child: &str) -> bool {
    child == parent || child.starts_with(&format!("{parent}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_input_is_rooted_at_root() {
        assert_eq!(resolve("/srv", "/srv/alice", "/etc/passwd").unwrap(), "/srv/etc/passwd");
    }

    #[test]
    fn relative_input_is_rooted_at_cwd() {
        assert_eq!(resolve("/srv", "/srv/alice", "note.txt").unwrap(), "/srv/alice/note.txt");
    }

    #[test]
    fn dot_dot_collapses_within_bounds() {
        assert_eq!(resolve("/srv", "/srv/alice/sub", "../note.txt").unwrap(), "/srv/alice/note.txt");
    }

    #[test]
    fn traversal_above_root_is_clamped_not_rejected() {
        // resolve() never descends below `/`; the PERM check happens one
        // layer up via `is_within`, against the session's home.
        let resolved = resolve("/srv", "/srv", "../../../etc/passwd").unwrap();
        assert_eq!(resolved, "/etc/passwd");
    }

    #[test]
    fn collapses_dot_and_dot_dot_segments() {
        assert_eq!(resolve("/", "/a", "./b/../c").unwrap(), "/a/c");
    }

    #[test]
    fn empty_input_is_invalid() {
        assert!(resolve("/srv", "/srv/alice", "").is_err());
    }

    #[test]
    fn is_within_requires_slash_boundary() {
        assert!(is_within("/srv/alice", "/srv/alice"));
        assert!(is_within("/srv/alice", "/srv/alice/note.txt"));
        assert!(!is_within("/srv/alice", "/srv/alice2"));
        assert!(!is_within("/srv/alice", "/srv/bob"));
    }
}
