use crate::CoreError;
use std::path::{Path, PathBuf};

/// Resolve `candidate` against `base`, refusing anything that would land
/// outside it.
///
/// Purely lexical: no filesystem access, symlinks are not followed. Both `/`
/// and `\` separate components. Absolute candidates (POSIX root, backslash
/// root, or a drive-letter prefix) are rejected outright.
pub fn resolve(base: &Path, candidate: &str) -> Result<PathBuf, CoreError> {
    if is_absolute(candidate) {
        return Err(CoreError::PathTraversal(candidate.to_owned()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in candidate.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(CoreError::PathTraversal(candidate.to_owned()));
                }
            }
            name => parts.push(name),
        }
    }

    let mut resolved = base.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

fn is_absolute(candidate: &str) -> bool {
    if candidate.starts_with('/') || candidate.starts_with('\\') {
        return true;
    }
    let bytes = candidate.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_escape_rejected() {
        let err = resolve(Path::new("/base"), "../etc/passwd").unwrap_err();
        assert!(matches!(err, CoreError::PathTraversal(_)));
    }

    #[test]
    fn inner_parent_is_cleaned() {
        let p = resolve(Path::new("/base"), "a/b/../c").unwrap();
        assert_eq!(p, PathBuf::from("/base/a/c"));
    }

    #[test]
    fn absolute_forms_rejected() {
        for bad in ["/etc/passwd", "\\windows\\system32", "C:\\x", "c:relative"] {
            assert!(
                matches!(resolve(Path::new("/base"), bad), Err(CoreError::PathTraversal(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn backslash_separators_are_split() {
        let p = resolve(Path::new("/base"), "dir\\sub\\..\\file.py").unwrap();
        assert_eq!(p, PathBuf::from("/base/dir/file.py"));
        assert!(resolve(Path::new("/base"), "a\\..\\..\\x").is_err());
    }

    #[test]
    fn base_itself_is_allowed() {
        assert_eq!(resolve(Path::new("/base"), "").unwrap(), PathBuf::from("/base"));
        assert_eq!(resolve(Path::new("/base"), "a/..").unwrap(), PathBuf::from("/base"));
        assert_eq!(resolve(Path::new("/base"), "./.").unwrap(), PathBuf::from("/base"));
    }

    #[test]
    fn escape_after_descent_rejected() {
        assert!(resolve(Path::new("/base"), "a/../../b").is_err());
        assert!(resolve(Path::new("/base"), "a/./b/../../..").is_err());
    }
}
