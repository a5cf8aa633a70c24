//! Path canonicalization and the project-relative keys used by the registry.
//!
//! Registry keys come in two flavors: project-inner paths starting with `/`
//! (or plain absolute paths, for files addressed by location on disk) and
//! external-package names starting with `@`.  Build outputs live in a mirror
//! of the project tree under the build root.

use anyhow::bail;

/// Name of the build output directory under the project root.
pub const BUILD_DIR_NAME: &str = ".zmade";

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar".
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut comps: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match comps.last() {
                Some(&"..") => comps.push(".."),
                Some(_) => {
                    comps.pop();
                }
                // Can't back up past the root of an absolute path.
                None if absolute => {}
                None => comps.push(".."),
            },
            comp => comps.push(comp),
        }
    }
    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&comps.join("/"));
    if out.is_empty() {
        out.push('.');
    }
    if (path.ends_with('/') || path.ends_with("/.")) && out != "." && !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Make `path` absolute against `cwd` (itself absolute), lexically normalized.
pub fn absolute_path(path: &str, cwd: &str) -> String {
    if path.starts_with('/') {
        canon_path(path)
    } else {
        canon_path(&format!("{}/{}", cwd, path))
    }
}

/// The path of `path` as seen from `base`, computed lexically ("../x/y").
pub fn lexically_relative(path: &str, base: &str) -> String {
    let path = canon_path(path);
    let base = canon_path(base);
    let pc: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let bc: Vec<&str> = base.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let common = pc.iter().zip(bc.iter()).take_while(|(a, b)| a == b).count();
    let mut out: Vec<&str> = Vec::new();
    for _ in common..bc.len() {
        out.push("..");
    }
    out.extend(&pc[common..]);
    if out.is_empty() {
        return ".".to_string();
    }
    out.join("/")
}

/// The part of `path` after the last '/', or all of it.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(p) => &path[p + 1..],
        None => path,
    }
}

/// The part of `path` up to and including the last '/', or "./".
pub fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(p) => path[..p + 1].to_string(),
        None => "./".to_string(),
    }
}

/// Project root and build root, both absolute with a trailing '/'.
/// All key and build-path computation hangs off these two.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: String,
    pub build_root: String,
}

impl ProjectPaths {
    pub fn new(root: &str) -> ProjectPaths {
        let mut root = canon_path(root);
        if !root.ends_with('/') {
            root.push('/');
        }
        let build_root = format!("{}{}/", root, BUILD_DIR_NAME);
        ProjectPaths { root, build_root }
    }

    /// Convert a user-supplied path into a registry key.  Paths already
    /// starting with '/' or '@' pass through; relative paths are resolved
    /// against `cwd` and re-rooted at the project root.
    pub fn inner_path(&self, path: &str, cwd: &str) -> String {
        if path.starts_with('/') || path.starts_with('@') {
            return path.to_string();
        }
        let abs = absolute_path(path, cwd);
        match abs.strip_prefix(self.root.trim_end_matches('/')) {
            Some(rel) if rel.starts_with('/') => rel.to_string(),
            Some("") => "/".to_string(),
            _ => abs,
        }
    }

    /// Map a path into the build tree, returning an absolute normalized path.
    /// Paths already inside the build root pass through.
    pub fn build_path(&self, path: &str, cwd: &str) -> String {
        if path.is_empty() {
            return String::new();
        }
        if path.starts_with('/') && path.starts_with(&self.build_root) {
            return canon_path(path);
        }
        let inner = self.inner_path(path, cwd);
        let mapped = if let Some(rel) = inner.strip_prefix(&self.root) {
            format!("{}{}", self.build_root, rel)
        } else {
            // Both "/x" and "@pkg/x" drop their first character.
            format!("{}{}", self.build_root, &inner[1..])
        };
        canon_path(&mapped)
    }

    /// Normalize a library name into its registry key.
    ///
    /// Strips a leading ':', rewrites a trailing ":leaf" into "/leaf"
    /// (bazel shorthand: "//a:b" means "/a/b"), applies inner-path
    /// canonicalization, and for imported libraries forces an '@' prefix,
    /// appending '/' when the name has no package-relative part.
    pub fn formalize_lib_name(
        &self,
        lib_name: &str,
        imported: bool,
        cwd: &str,
    ) -> anyhow::Result<String> {
        if lib_name.is_empty() {
            bail!("empty library name");
        }
        let mut name = lib_name.to_string();
        if imported && !name.starts_with('@') {
            name.insert(0, '@');
        }
        if name.starts_with(':') {
            name.remove(0);
        }
        let fname = file_name(&name).to_string();
        if let Some(p) = fname.rfind(':') {
            let mut leaf = fname;
            leaf.replace_range(p..p + 1, "/");
            if leaf.contains(':') {
                bail!(
                    "the filename part of library name({}) should have one ':' at most",
                    lib_name
                );
            }
            name = format!("{}{}", dir_name(&name), leaf);
        }
        name = self.inner_path(&name, cwd);
        if name.starts_with('@') && !name.contains('/') {
            name.push('/');
        }
        Ok(canon_path(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_noop() {
        assert_eq!(canon_path("foo"), "foo");
        assert_eq!(canon_path("foo/bar"), "foo/bar");
        assert_eq!(canon_path("/foo/bar"), "/foo/bar");
    }

    #[test]
    fn canon_dot() {
        assert_eq!(canon_path("./foo"), "foo");
        assert_eq!(canon_path("foo/."), "foo/");
        assert_eq!(canon_path("foo/./bar"), "foo/bar");
        assert_eq!(canon_path("./"), ".");
        assert_eq!(canon_path("."), ".");
    }

    #[test]
    fn canon_parent() {
        assert_eq!(canon_path("foo/../bar"), "bar");
        assert_eq!(canon_path("/foo/../bar"), "/bar");
        assert_eq!(canon_path("../foo"), "../foo");
        assert_eq!(canon_path("foo/.."), ".");
        assert_eq!(canon_path("/.."), "/");
        assert_eq!(canon_path("a//b///c"), "a/b/c");
    }

    #[test]
    fn relative() {
        assert_eq!(lexically_relative("/a/b/c", "/a/b"), "c");
        assert_eq!(lexically_relative("/a/b", "/a/b/c"), "..");
        assert_eq!(lexically_relative("/a/x/y", "/a/b"), "../x/y");
        assert_eq!(lexically_relative("/a/b", "/a/b"), ".");
    }

    fn paths() -> ProjectPaths {
        ProjectPaths::new("/workspace")
    }

    #[test]
    fn inner_paths() {
        let p = paths();
        assert_eq!(p.inner_path("/abs/x.a", "/workspace"), "/abs/x.a");
        assert_eq!(p.inner_path("@pkg/lib", "/workspace"), "@pkg/lib");
        assert_eq!(p.inner_path("net", "/workspace/core"), "/core/net");
        assert_eq!(p.inner_path("../util/s", "/workspace/core"), "/util/s");
    }

    #[test]
    fn build_paths() {
        let p = paths();
        assert_eq!(
            p.build_path("a.o", "/workspace/core"),
            "/workspace/.zmade/core/a.o"
        );
        // Paths already in the build tree pass through.
        assert_eq!(
            p.build_path("/workspace/.zmade/core/a.o", "/workspace"),
            "/workspace/.zmade/core/a.o"
        );
        // Absolute in-project paths map under the build root.
        assert_eq!(
            p.build_path("/workspace/core/a.o", "/workspace"),
            "/workspace/.zmade/core/a.o"
        );
        assert_eq!(
            p.build_path("/lib/libx.a", "/workspace"),
            "/workspace/.zmade/lib/libx.a"
        );
    }

    #[test]
    fn lib_names() {
        let p = paths();
        let cwd = "/workspace/core";
        assert_eq!(p.formalize_lib_name("//a:b", false, cwd).unwrap(), "/a/b");
        assert_eq!(p.formalize_lib_name("//:b", false, cwd).unwrap(), "/b");
        assert_eq!(p.formalize_lib_name(":b", false, cwd).unwrap(), "/core/b");
        assert_eq!(
            p.formalize_lib_name("@pkg//:lib", false, cwd).unwrap(),
            "@pkg/lib"
        );
        assert_eq!(
            p.formalize_lib_name("curl/net", false, cwd).unwrap(),
            "/core/curl/net"
        );
        assert_eq!(
            p.formalize_lib_name("gflags", true, cwd).unwrap(),
            "@gflags/"
        );
        assert!(p.formalize_lib_name("a:b:c", false, cwd).is_err());
    }
}
