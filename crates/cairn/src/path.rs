//! Path newtypes and wildcard matching used throughout the build model.
//!
//! Buildfile semantics distinguish directory paths from file paths at the
//! type level: a `DirPath` always renders with a trailing separator and is
//! stored lexically normalized so that two spellings of the same directory
//! compare equal. Normalization is purely lexical (`.` removed, `..`
//! collapsed against a preceding component); no filesystem access happens
//! here.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

/// A lexically normalized directory path.
///
/// The empty path is valid and means "unspecified" (for example the `out`
/// half of an in-source target key). Ordering is by the normalized string
/// representation, which gives prefix-ordered iteration in scope and
/// target maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirPath(PathBuf);

impl DirPath {
    pub fn new(p: impl Into<PathBuf>) -> Self {
        Self(normalize(&p.into()))
    }

    /// The current directory as a relative directory path (`./`).
    pub fn current() -> Self {
        Self(PathBuf::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.0.is_absolute()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Append a (possibly multi-component) relative path, renormalizing so
    /// that `..` components collapse.
    #[must_use]
    pub fn join(&self, rel: impl AsRef<Path>) -> Self {
        Self(normalize(&self.0.join(rel)))
    }

    /// Append a single file name, producing a file path.
    pub fn join_file(&self, file: impl AsRef<Path>) -> PathBuf {
        self.0.join(file)
    }

    /// True if `self` is `other` or a parent directory of `other`.
    pub fn contains(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// The path of `self` relative to `base`, if `base` contains it.
    pub fn relative_to(&self, base: &Self) -> Option<Self> {
        self.0.strip_prefix(&base.0).ok().map(|p| Self(p.to_path_buf()))
    }

    /// The parent directory, or the empty path at a root.
    pub fn directory(&self) -> Self {
        match self.0.parent() {
            Some(p) => Self(p.to_path_buf()),
            None => Self::current(),
        }
    }

    /// The last component, or `""` for empty and root paths.
    pub fn leaf(&self) -> &str {
        self.0.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }

    /// Number of components, used as nesting depth when ordering scopes.
    pub fn depth(&self) -> usize {
        self.0.components().count()
    }

    /// The representation without the trailing separator, for joining.
    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or("")
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("./");
        }
        let s = self.0.to_string_lossy();
        if s.ends_with(std::path::MAIN_SEPARATOR) {
            f.write_str(&s)
        } else {
            write!(f, "{s}{}", std::path::MAIN_SEPARATOR)
        }
    }
}

impl From<&str> for DirPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<PathBuf> for DirPath {
    fn from(p: PathBuf) -> Self {
        Self::new(p)
    }
}

impl AsRef<Path> for DirPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

fn normalize(p: &Path) -> PathBuf {
    let mut r = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                // Collapse against a preceding normal component; keep a
                // leading ".." in relative paths.
                match r.components().next_back() {
                    Some(Component::Normal(_)) => {
                        r.pop();
                    }
                    Some(Component::RootDir | Component::Prefix(_)) => {}
                    _ => r.push(".."),
                }
            }
            other => r.push(other.as_os_str()),
        }
    }
    // `./` (and `a/..`) denote the current directory, which is distinct
    // from the empty "unspecified" path.
    if r.as_os_str().is_empty() && !p.as_os_str().is_empty() {
        r.push(".");
    }
    r
}

/// Wildcard matching with buildfile semantics: `*` matches any sequence of
/// characters except the directory separator, `**` matches any sequence
/// including separators, and `?` matches a single non-separator character.
///
/// Matching is over the entire `name`; there is no implicit anchoring
/// looseness.
pub fn path_match(pattern: &str, name: &str) -> bool {
    match_impl(pattern.as_bytes(), name.as_bytes())
}

fn match_impl(p: &[u8], n: &[u8]) -> bool {
    if p.is_empty() {
        return n.is_empty();
    }
    match p[0] {
        b'*' => {
            let multi = p.len() > 1 && p[1] == b'*';
            let rest = if multi { &p[2..] } else { &p[1..] };
            // Greedily try every split point, shortest first.
            let mut i = 0;
            loop {
                if match_impl(rest, &n[i..]) {
                    return true;
                }
                if i == n.len() || (!multi && is_sep(n[i])) {
                    return false;
                }
                i += 1;
            }
        }
        b'?' => !n.is_empty() && !is_sep(n[0]) && match_impl(&p[1..], &n[1..]),
        c => !n.is_empty() && n[0] == c && match_impl(&p[1..], &n[1..]),
    }
}

fn is_sep(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

/// A target platform triplet (`cpu-vendor-system` with an optional trailing
/// version), kept both parsed and in its original spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetTriplet {
    pub cpu: String,
    pub vendor: String,
    pub system: String,
    pub version: String,
    repr: String,
}

impl TargetTriplet {
    /// Parse a triplet. Two-component forms (`cpu-system`) get an
    /// `unknown` vendor; four components put the tail into `version`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("invalid target triplet '{s}'"));
        }
        let (cpu, vendor, system, version) = match parts.len() {
            2 => (parts[0], "unknown", parts[1].to_owned(), String::new()),
            3 => (parts[0], parts[1], parts[2].to_owned(), String::new()),
            _ => (parts[0], parts[1], parts[2..parts.len() - 1].join("-"), parts[parts.len() - 1].to_owned()),
        };
        Ok(Self {
            cpu: cpu.to_owned(),
            vendor: vendor.to_owned(),
            system,
            version,
            repr: s.to_owned(),
        })
    }

    /// The host triplet synthesized from the std compile-time constants.
    pub fn host() -> Self {
        let system = match std::env::consts::OS {
            "macos" => "darwin",
            "windows" => "windows-msvc",
            os => os,
        };
        let repr = format!("{}-unknown-{system}", std::env::consts::ARCH);
        Self::parse(&repr).unwrap_or_default()
    }

    /// Coarse platform class used by the link rule (`linux`, `macos`,
    /// `windows`, `bsd`, or `other`).
    pub fn class(&self) -> &'static str {
        let s = self.system.as_str();
        if s.contains("linux") {
            "linux"
        } else if s.contains("darwin") || s.contains("macos") {
            "macos"
        } else if s.contains("win32") || s.contains("windows") || s.contains("mingw") {
            "windows"
        } else if s.contains("bsd") {
            "bsd"
        } else {
            "other"
        }
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl fmt::Display for TargetTriplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(DirPath::new("a/./b/../c").as_str(), "a/c");
        assert_eq!(DirPath::new("../a").as_str(), "../a");
    }

    #[test]
    fn star_does_not_cross_separator() {
        assert!(path_match("*.c", "hello.c"));
        assert!(!path_match("*.c", "sub/hello.c"));
        assert!(path_match("**.c", "sub/hello.c"));
        assert!(path_match("h?llo", "hello"));
        assert!(!path_match("h?llo", "h/llo"));
    }

    #[test]
    fn triplet_forms() {
        let t = TargetTriplet::parse("x86_64-linux-gnu").unwrap();
        assert_eq!(t.cpu, "x86_64");
        assert_eq!(t.class(), "linux");
        let t = TargetTriplet::parse("aarch64-apple-darwin21").unwrap();
        assert_eq!(t.vendor, "apple");
        assert_eq!(t.class(), "macos");
    }
}
