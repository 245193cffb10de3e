//! Git branch names to path-safe directory fragments.

/// Longest fragment we will emit; long branch names get truncated.
const MAX_LEN: usize = 48;

/// Turns a git branch name into a directory-name fragment.
///
/// Lowercases, maps anything outside `[a-z0-9._-]` to `-`, squeezes repeated
/// dashes, truncates, and trims leading/trailing separators. Idempotent:
/// `sanitize_branch(sanitize_branch(s)) == sanitize_branch(s)`.
pub fn sanitize_branch(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    let mut last_dash = false;
    for ch in branch.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        let mapped = if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(mapped);
    }

    out.truncate(MAX_LEN);
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "detached".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_branch;

    #[test]
    fn maps_slashes_and_case() {
        assert_eq!(sanitize_branch("feature/My-Branch"), "feature-my-branch");
        assert_eq!(sanitize_branch("fix/issue #42"), "fix-issue-42");
    }

    #[test]
    fn squeezes_and_trims_separators() {
        assert_eq!(sanitize_branch("--weird//name--"), "weird-name");
        assert_eq!(sanitize_branch("..dots.."), "dots");
    }

    #[test]
    fn empty_and_symbol_only_fall_back() {
        assert_eq!(sanitize_branch(""), "detached");
        assert_eq!(sanitize_branch("///"), "detached");
    }

    #[test]
    fn idempotent() {
        for s in [
            "feature/My-Branch",
            "--weird//name--",
            "héllo wörld",
            "a".repeat(100).as_str(),
            "x/-/-/y",
        ] {
            let once = sanitize_branch(s);
            assert_eq!(sanitize_branch(&once), once, "not idempotent for {s:?}");
        }
    }
}
