//! Vault-relative path handling.
//!
//! Every path the core compares is vault-relative and forward-slash
//! normalized, with no leading `./` or `/` and no trailing slash. The vault
//! root itself is the empty string.

/// Normalize a vault-relative path.
pub fn normalize(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    replaced
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// True if `a` and `b` are equal or one is an ancestor of the other.
///
/// `a/b` overlaps `a/b/c` and `a`, but not `a/bc`.
pub fn overlaps(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }
    is_descendant(&a, &b) || is_descendant(&b, &a)
}

/// True if `path` lies strictly below `ancestor`. Both must be normalized.
fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// `path` moved from below `from` to below `to`; `None` if `path` is not
/// `from` or under it.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    let path = normalize(path);
    let from = normalize(from);
    if path == from {
        return Some(normalize(to));
    }
    if from.is_empty() || !is_descendant(&path, &from) {
        return None;
    }
    Some(join(to, &path[from.len() + 1..]))
}

/// True if any path in `left` overlaps any path in `right`.
pub fn any_overlap<A, B>(left: &[A], right: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    left.iter()
        .any(|a| right.iter().any(|b| overlaps(a.as_ref(), b.as_ref())))
}

/// Final component of a normalized path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a normalized path, `""` for top-level entries.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Join a parent and a name into a normalized path.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        normalize(name)
    } else {
        normalize(&format!("{}/{}", parent, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("\\parts\\bracket.sldprt"), "parts/bracket.sldprt");
        assert_eq!(normalize("./parts//a/"), "parts/a");
        assert_eq!(normalize("/"), "");
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps("/a/b", "/a/b/c"));
        assert!(overlaps("a/b/c", "a/b"));
        assert!(overlaps("a/b", "a/b"));
        assert!(overlaps("", "anything"));
        assert!(!overlaps("a/b", "a/bc"));
        assert!(!overlaps("a/b", "a/c"));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("a/b/c.txt", "a/b", "x").as_deref(), Some("x/c.txt"));
        assert_eq!(rebase("a/b", "a/b", "x/y").as_deref(), Some("x/y"));
        assert_eq!(rebase("a/bc/d.txt", "a/b", "x"), None);
        assert_eq!(rebase("c.txt", "a", "x"), None);
    }

    #[test]
    fn test_any_overlap() {
        assert!(any_overlap(&["x", "a/b"], &["a"]));
        assert!(!any_overlap(&["x", "y"], &["a", "b/c"]));
        assert!(!any_overlap::<&str, &str>(&[], &["a"]));
    }

    #[test]
    fn test_name_parent_join() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
        assert_eq!(parent("a/b/c.txt"), "a/b");
        assert_eq!(parent("c.txt"), "");
        assert_eq!(join("a/b", "c.txt"), "a/b/c.txt");
        assert_eq!(join("", "c.txt"), "c.txt");
    }
}
