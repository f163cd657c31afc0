//! Path normalization (§3 "Ownership", §9 "Normalization"): map an absolute path to a
//! filesystem-safe, single-segment build-directory name.

use std::path::{Path, PathBuf};

/// The delimiter substituted for each path separator. Doubled so that a real doubled
/// separator in the input (there never is one on the filesystems we target, but the
/// substitution must still be invertible in spirit) can't collide with a single
/// separator's encoding.
const SEP_MARKER: &str = "__";

/// Map an absolute path to a single path-segment name, injective over the set of
/// absolute paths a filesystem can produce (invariant 3, §8).
pub fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        if ch == std::path::MAIN_SEPARATOR {
            out.push_str(SEP_MARKER);
        } else if ch == '_' {
            // Escape a literal underscore so it can never be confused with the
            // separator marker during eyeballing of build directory names.
            out.push_str("_u_");
        } else {
            out.push(ch);
        }
    }
    out
}

/// `<home>/_build/<normalize(entry_path)>`
pub fn build_dir_for(home: &Path, entry_path: &Path) -> PathBuf {
    home.join("_build").join(normalize(entry_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_a_single_segment() {
        let n = normalize(Path::new("/home/user/project/main.ml"));
        assert!(!n.contains(std::path::MAIN_SEPARATOR));
    }

    #[test]
    fn normalize_is_injective_for_distinct_paths() {
        let a = normalize(Path::new("/a/b/c.ml"));
        let b = normalize(Path::new("/a/b_c.ml"));
        let c = normalize(Path::new("/a_b/c.ml"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn build_dir_nests_under_build() {
        let dir = build_dir_for(Path::new("/home/.mach"), Path::new("/proj/main.ml"));
        assert!(dir.starts_with("/home/.mach/_build"));
    }
}
