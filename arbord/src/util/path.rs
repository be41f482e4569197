//! Lexical path and name helpers.
//!
//! Everything here is pure string/Path manipulation; nothing touches the
//! filesystem. Filesystem-aware walks live in [`crate::util::fs`].

use std::path::{Component, Path, PathBuf};

use arbor_shared::{ArborError, ArborResult};

/// Total container name length cap, bytes.
pub const MAX_NAME_LEN: usize = 200;

/// Per-component name length cap, bytes.
pub const MAX_COMPONENT_LEN: usize = 128;

/// Absolute prefixes a user-supplied storage or volume path may not touch.
pub const SYSTEM_PATHS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib32", "/lib64", "/libx32", "/proc", "/run",
    "/sbin", "/sys", "/usr", "/var",
];

/// Validate a full container name against the naming rules.
///
/// Names are slash-delimited, nonempty, at most [`MAX_NAME_LEN`] bytes,
/// components at most [`MAX_COMPONENT_LEN`] bytes drawn from
/// `[A-Za-z0-9_.:@-]`, with no empty, `.` or `self` components. The only
/// name starting with `/` is the root literal `/` itself (and the
/// distinguished `/porto` first-level child, which the core creates).
pub fn validate_name(name: &str) -> ArborResult<()> {
    if name == "/" {
        return Ok(());
    }
    if name.is_empty() {
        return Err(ArborError::invalid_value("container name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ArborError::invalid_value(format!(
            "container name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('/') {
        return Err(ArborError::invalid_value(format!(
            "container name {:?} must not start with /",
            name
        )));
    }
    for component in name.split('/') {
        validate_name_component(component)?;
    }
    Ok(())
}

fn validate_name_component(component: &str) -> ArborResult<()> {
    if component.is_empty() {
        return Err(ArborError::invalid_value("empty container name component"));
    }
    if component.len() > MAX_COMPONENT_LEN {
        return Err(ArborError::invalid_value(format!(
            "container name component longer than {} bytes",
            MAX_COMPONENT_LEN
        )));
    }
    if component == "." || component == "self" {
        return Err(ArborError::invalid_value(format!(
            "reserved container name component {:?}",
            component
        )));
    }
    for ch in component.chars() {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | ':' | '@' | '-')) {
            return Err(ArborError::invalid_value(format!(
                "forbidden character {:?} in container name component {:?}",
                ch, component
            )));
        }
    }
    Ok(())
}

/// Parent of a slash-delimited container name; `None` for first-level
/// names (their parent is the root `/`).
pub fn parent_name(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(parent, _)| parent)
}

/// Last component of a container name.
pub fn base_name(name: &str) -> &str {
    name.rsplit_once('/').map_or(name, |(_, base)| base)
}

/// Depth of a container name; the root `/` is level 0.
pub fn name_level(name: &str) -> usize {
    if name == "/" {
        0
    } else {
        name.split('/').count()
    }
}

/// Escape a container name for embedding into a single cgroup path
/// component: `%` doubles, `/` becomes `%`.
pub fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '%' => out.push_str("%%"),
            '/' => out.push('%'),
            _ => out.push(ch),
        }
    }
    out
}

/// Inverse of [`escape_name`].
pub fn unescape_name(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '%' {
            if chars.peek() == Some(&'%') {
                chars.next();
                out.push('%');
            } else {
                out.push('/');
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Lexically normalize a path: strip `.` components and duplicate
/// separators. `..` components are preserved (callers reject them).
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// True when the path contains a `..` component.
pub fn has_dotdot(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

/// Require an absolute path with no `..` components.
pub fn require_normal_absolute(path: &Path) -> ArborResult<()> {
    if !path.is_absolute() {
        return Err(ArborError::invalid_path(format!(
            "path {} is not absolute",
            path.display()
        )));
    }
    if has_dotdot(path) {
        return Err(ArborError::invalid_path(format!(
            "path {} contains ..",
            path.display()
        )));
    }
    Ok(())
}

/// True when `path` equals `base` or lies below it, component-wise.
pub fn is_same_or_inner(base: &Path, path: &Path) -> bool {
    path.strip_prefix(base).is_ok()
}

/// True when `path` lies strictly below `base`.
pub fn is_strictly_inner(base: &Path, path: &Path) -> bool {
    match path.strip_prefix(base) {
        Ok(rest) => !rest.as_os_str().is_empty(),
        Err(_) => false,
    }
}

/// Reject paths under the fixed system-path blacklist.
pub fn check_not_system_path(path: &Path) -> ArborResult<()> {
    if path == Path::new("/") {
        return Err(ArborError::invalid_path("/ is a system path"));
    }
    for sys in SYSTEM_PATHS {
        if is_same_or_inner(Path::new(sys), path) {
            return Err(ArborError::invalid_path(format!(
                "{} is under the system path {}",
                path.display(),
                sys
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_accepts_sane_names() {
        for name in ["/", "a", "a/b", "a/b/c", "web-1", "job_0:x", "a.b@c"] {
            validate_name(name).unwrap_or_else(|e| panic!("{}: {}", name, e));
        }
    }

    #[test]
    fn test_validate_name_rejects() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let long_component = "y".repeat(MAX_COMPONENT_LEN + 1);
        for name in [
            "",
            "/a",
            "a//b",
            "a/",
            "/porto/x",
            "self",
            "a/self/b",
            "a/./b",
            "a b",
            "a\tb",
            "a/б",
            long.as_str(),
            long_component.as_str(),
        ] {
            assert!(validate_name(name).is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_parent_and_base() {
        assert_eq!(parent_name("a/b/c"), Some("a/b"));
        assert_eq!(parent_name("a"), None);
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("a"), "a");
        assert_eq!(name_level("/"), 0);
        assert_eq!(name_level("a"), 1);
        assert_eq!(name_level("a/b/c"), 3);
    }

    #[test]
    fn test_escape_roundtrip() {
        for name in ["a", "a/b", "a%b", "a%/b%%c", "/"] {
            assert_eq!(unescape_name(&escape_name(name)), name);
        }
        assert_eq!(escape_name("a/b"), "a%b");
        assert_eq!(escape_name("a%b"), "a%%b");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b//c")), PathBuf::from("/a/b/c"));
        assert_eq!(normalize(Path::new(".")), PathBuf::from("."));
        assert!(has_dotdot(Path::new("/a/../b")));
        assert!(!has_dotdot(Path::new("/a/b")));
    }

    #[test]
    fn test_system_paths() {
        assert!(check_not_system_path(Path::new("/etc")).is_err());
        assert!(check_not_system_path(Path::new("/etc/passwd")).is_err());
        assert!(check_not_system_path(Path::new("/")).is_err());
        assert!(check_not_system_path(Path::new("/place/volumes")).is_ok());
        assert!(check_not_system_path(Path::new("/home/u/data")).is_ok());
    }

    #[test]
    fn test_inner_path_checks() {
        let base = Path::new("/place/porto_volumes/3");
        assert!(is_same_or_inner(base, base));
        assert!(is_strictly_inner(base, &base.join("volume")));
        assert!(!is_strictly_inner(base, base));
        assert!(!is_same_or_inner(base, Path::new("/place/porto_volumes/33")));
    }

    proptest::proptest! {
        #[test]
        fn prop_escape_roundtrip(name in "[A-Za-z0-9_.:@%/-]{0,64}") {
            proptest::prop_assert_eq!(unescape_name(&escape_name(&name)), name);
        }

        #[test]
        fn prop_escaped_has_no_slash(name in "[A-Za-z0-9_.:@%/-]{0,64}") {
            proptest::prop_assert!(!escape_name(&name).contains('/'));
        }
    }
}
